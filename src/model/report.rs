/// Slow-path report produced when a traced request exceeds its threshold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeReport {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub entry_service: String,
    pub entry_url: String,
    pub entry_span_id: String,
    pub mutated_service: String,
    pub mutated_url: String,
    pub mutated_pid: u32,
    pub mutated_span_id: String,
    pub cause: String,
    pub duration_ns: u64,
    pub is_drop: bool,
    /// Encoded report body.
    pub data: String,
}

/// Error-path report. The relation tree describes how the error travelled
/// between services.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub is_drop: bool,
    pub cause: String,
    pub relation_tree: Option<RelationNode>,
    pub data: String,
}

impl ErrorReport {
    /// Root service, url and span id of the relation tree, used as join keys
    /// between error_report and error_propagation rows.
    pub fn join_keys(&self) -> Option<(&str, &str, &str)> {
        self.relation_tree
            .as_ref()
            .map(|root| (root.service_name.as_str(), root.url.as_str(), root.span_id.as_str()))
    }
}

/// Outgoing client call recorded on the node it reached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientCall {
    pub group: String,
    pub client_type: String,
    pub peer: String,
    pub key: String,
    pub duration_ns: u64,
    pub is_error: bool,
}

/// Node in a cross-service call tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationNode {
    pub service_name: String,
    pub instance: String,
    pub url: String,
    pub span_id: String,
    pub start_time_ns: u64,
    pub is_traced: bool,
    pub is_error: bool,
    pub is_async: bool,
    /// Set when this node is the true entry of the request.
    pub top_node: bool,
    pub error_types: Vec<String>,
    pub error_msgs: Vec<String>,
    pub client: Option<ClientCall>,
    pub children: Vec<RelationNode>,
}

impl RelationNode {
    /// Visit every node in depth-first pre-order with its depth and
    /// dot-separated index path (root is `"0"`).
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a RelationNode, u32, &str)) {
        self.walk_inner(0, "0", visit);
    }

    fn walk_inner<'a>(
        &'a self,
        depth: u32,
        path: &str,
        visit: &mut impl FnMut(&'a RelationNode, u32, &str),
    ) {
        visit(self, depth, path);
        for (idx, child) in self.children.iter().enumerate() {
            let child_path = format!("{path}.{idx}");
            child.walk_inner(depth + 1, &child_path, visit);
        }
    }
}

/// One node of a flattened error propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationNode {
    pub service: String,
    pub instance: String,
    pub url: String,
    pub is_traced: bool,
    pub is_error: bool,
    pub error_types: String,
    pub error_msgs: String,
    pub depth: u32,
    pub path: String,
}

/// Error propagation row derived from an error report at flush time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorPropagation {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub entry_service: String,
    pub entry_url: String,
    pub entry_span_id: String,
    pub nodes: Vec<PropagationNode>,
}

impl ErrorPropagation {
    /// Returns `None` for dropped reports and reports without a relation tree.
    pub fn from_report(report: &ErrorReport) -> Option<Self> {
        if report.is_drop {
            return None;
        }
        let root = report.relation_tree.as_ref()?;

        let mut nodes = Vec::new();
        root.walk(&mut |node, depth, path| {
            nodes.push(PropagationNode {
                service: node.service_name.clone(),
                instance: node.instance.clone(),
                url: node.url.clone(),
                is_traced: node.is_traced,
                is_error: node.is_error,
                error_types: node.error_types.join(","),
                error_msgs: node.error_msgs.join(","),
                depth,
                path: path.to_string(),
            });
        });

        Some(Self {
            timestamp_ns: report.timestamp_ns,
            trace_id: report.trace_id.clone(),
            entry_service: root.service_name.clone(),
            entry_url: root.url.clone(),
            entry_span_id: root.span_id.clone(),
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(service: &str, children: Vec<RelationNode>) -> RelationNode {
        RelationNode {
            service_name: service.to_string(),
            url: format!("/{service}"),
            span_id: format!("span-{service}"),
            is_traced: true,
            children,
            ..Default::default()
        }
    }

    #[test]
    fn test_propagation_preorder_paths() {
        let mut failing = node("c", vec![]);
        failing.is_error = true;
        failing.error_types = vec!["Timeout".to_string(), "IOError".to_string()];

        let report = ErrorReport {
            timestamp_ns: 7,
            trace_id: "t1".to_string(),
            relation_tree: Some(node("a", vec![node("b", vec![failing]), node("d", vec![])])),
            ..Default::default()
        };

        let prop = ErrorPropagation::from_report(&report).unwrap();
        assert_eq!(prop.entry_service, "a");
        assert_eq!(prop.entry_span_id, "span-a");
        assert_eq!(prop.trace_id, "t1");

        let services: Vec<&str> = prop.nodes.iter().map(|n| n.service.as_str()).collect();
        assert_eq!(services, vec!["a", "b", "c", "d"]);
        let paths: Vec<&str> = prop.nodes.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["0", "0.0", "0.0.0", "0.1"]);
        let depths: Vec<u32> = prop.nodes.iter().map(|n| n.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
        assert_eq!(prop.nodes[2].error_types, "Timeout,IOError");
        assert!(prop.nodes[2].is_error);
    }

    #[test]
    fn test_propagation_skips_dropped_and_treeless() {
        let dropped = ErrorReport {
            is_drop: true,
            relation_tree: Some(node("a", vec![])),
            ..Default::default()
        };
        assert!(ErrorPropagation::from_report(&dropped).is_none());

        let treeless = ErrorReport::default();
        assert!(ErrorPropagation::from_report(&treeless).is_none());
        assert!(treeless.join_keys().is_none());
    }

    #[test]
    fn test_join_keys_match_propagation() {
        let report = ErrorReport {
            relation_tree: Some(node("gateway", vec![node("db", vec![])])),
            ..Default::default()
        };
        let prop = ErrorPropagation::from_report(&report).unwrap();
        assert_eq!(
            report.join_keys(),
            Some((
                prop.entry_service.as_str(),
                prop.entry_url.as_str(),
                prop.entry_span_id.as_str()
            ))
        );
    }
}
