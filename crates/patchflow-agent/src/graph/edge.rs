use serde::{Deserialize, Serialize};

/// `to` must not start before `from` completes.
///
/// Data dependencies are inferred from declared keys; explicit edges are
/// only needed for ordering without data flow, such as a setup step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// One edge from `from` to each of `targets`.
    pub fn fan_out<I, S>(from: &str, targets: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        targets.into_iter().map(|t| Self::new(from, t)).collect()
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out() {
        let edges = Edge::fan_out("clone", ["scan", "rev_parse"]);
        assert_eq!(edges, vec![Edge::new("clone", "scan"), Edge::new("clone", "rev_parse")]);
        assert_eq!(edges[0].to_string(), "clone -> scan");
    }

    #[test]
    fn test_edge_serde() {
        let e: Edge = serde_json::from_str(r#"{"from":"a","to":"b"}"#).unwrap();
        assert_eq!(e, Edge::new("a", "b"));
    }
}
