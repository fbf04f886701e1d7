use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 集群节点的成员信息
///
/// 由节点自己注册并定期心跳维护，引擎侧只读。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterNodeInfo {
    pub id: i32,
    pub hostname: String,
    /// 节点所属的组，影响带node_group约束的任务亲和性
    pub groups: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

impl ClusterNodeInfo {
    pub fn new(id: i32, hostname: impl Into<String>, groups: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname: hostname.into(),
            groups,
            last_heartbeat: now,
            active: true,
            registered_at: now,
        }
    }

    /// 将组列表编码为存储用的逗号分隔字符串
    pub fn groups_column(&self) -> String {
        self.groups.join(",")
    }

    /// 解析存储中的逗号分隔组列表
    pub fn parse_groups(column: &str) -> Vec<String> {
        column
            .split(',')
            .filter(|g| !g.is_empty())
            .map(|g| g.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_column_round_trip() {
        let node = ClusterNodeInfo::new(1, "host1", vec!["a".into(), "b".into()]);
        assert_eq!(node.groups_column(), "a,b");
        assert_eq!(
            ClusterNodeInfo::parse_groups("a,b"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_parse_groups_empty() {
        assert!(ClusterNodeInfo::parse_groups("").is_empty());
    }
}
