use super::report::RelationNode;

/// Call tree of one trace, fanned out at flush time into service
/// relationships, service clients and client latency metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Relation {
    pub trace_id: String,
    pub root: RelationNode,
}

/// One parent to child edge of a relation tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relationship {
    pub parent_service: String,
    pub parent_url: String,
    pub service: String,
    pub url: String,
    /// Index path of the child node, e.g. `0.1`.
    pub path: String,
    pub client_group: String,
    pub client_type: String,
    pub client_peer: String,
    pub client_key: String,
    pub parent_traced: bool,
    pub is_async: bool,
    pub is_traced: bool,
}

/// External dependency call made by a service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceClient {
    pub timestamp_ns: u64,
    pub trace_id: String,
    pub service: String,
    pub url: String,
    pub client_group: String,
    pub client_type: String,
    pub client_peer: String,
    pub client_key: String,
    pub duration_ns: u64,
    pub is_error: bool,
}

impl Relation {
    /// Rows of the service_relationship table report the entry as missing
    /// its top when the root is not the real request entry.
    pub fn miss_top(&self) -> bool {
        !self.root.top_node
    }

    /// Every parent to child edge in depth-first pre-order.
    pub fn collect_relationships(&self) -> Vec<Relationship> {
        let mut out = Vec::new();
        collect_edges(&self.root, "0", &mut |parent, child, path| {
            let client = child.client.clone().unwrap_or_default();
            out.push(Relationship {
                parent_service: parent.service_name.clone(),
                parent_url: parent.url.clone(),
                service: child.service_name.clone(),
                url: child.url.clone(),
                path: path.to_string(),
                client_group: client.group,
                client_type: client.client_type,
                client_peer: client.peer,
                client_key: client.key,
                parent_traced: parent.is_traced,
                is_async: child.is_async,
                is_traced: child.is_traced,
            });
        });
        out
    }

    /// Calls from a traced service into an untraced dependency.
    pub fn collect_service_clients(&self) -> Vec<ServiceClient> {
        let mut out = Vec::new();
        collect_edges(&self.root, "0", &mut |parent, child, _| {
            if child.is_traced {
                return;
            }
            let Some(client) = &child.client else {
                return;
            };
            out.push(ServiceClient {
                timestamp_ns: child.start_time_ns,
                trace_id: self.trace_id.clone(),
                service: parent.service_name.clone(),
                url: parent.url.clone(),
                client_group: client.group.clone(),
                client_type: client.client_type.clone(),
                client_peer: client.peer.clone(),
                client_key: client.key.clone(),
                duration_ns: client.duration_ns,
                is_error: client.is_error,
            });
        });
        out
    }
}

fn collect_edges<'a>(
    parent: &'a RelationNode,
    path: &str,
    visit: &mut impl FnMut(&'a RelationNode, &'a RelationNode, &str),
) {
    for (idx, child) in parent.children.iter().enumerate() {
        let child_path = format!("{path}.{idx}");
        visit(parent, child, &child_path);
        collect_edges(child, &child_path, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClientCall;

    fn sample() -> Relation {
        let mysql = RelationNode {
            service_name: "mysql".to_string(),
            url: "SELECT users".to_string(),
            start_time_ns: 50,
            client: Some(ClientCall {
                group: "db".to_string(),
                client_type: "mysql".to_string(),
                peer: "10.0.0.9:3306".to_string(),
                key: "users".to_string(),
                duration_ns: 2_000_000,
                is_error: false,
            }),
            ..Default::default()
        };
        let users = RelationNode {
            service_name: "users".to_string(),
            url: "/users".to_string(),
            is_traced: true,
            is_async: true,
            client: Some(ClientCall {
                group: "http".to_string(),
                client_type: "http".to_string(),
                peer: "users:8080".to_string(),
                ..Default::default()
            }),
            children: vec![mysql],
            ..Default::default()
        };
        Relation {
            trace_id: "trace-1".to_string(),
            root: RelationNode {
                service_name: "gateway".to_string(),
                url: "/api".to_string(),
                is_traced: true,
                top_node: true,
                children: vec![users],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_collect_relationships() {
        let relation = sample();
        assert!(!relation.miss_top());

        let edges = relation.collect_relationships();
        assert_eq!(edges.len(), 2);

        assert_eq!(edges[0].parent_service, "gateway");
        assert_eq!(edges[0].service, "users");
        assert_eq!(edges[0].path, "0.0");
        assert_eq!(edges[0].client_type, "http");
        assert!(edges[0].parent_traced);
        assert!(edges[0].is_async);
        assert!(edges[0].is_traced);

        assert_eq!(edges[1].parent_service, "users");
        assert_eq!(edges[1].service, "mysql");
        assert_eq!(edges[1].path, "0.0.0");
        assert_eq!(edges[1].client_peer, "10.0.0.9:3306");
        assert!(!edges[1].is_traced);
    }

    #[test]
    fn test_collect_service_clients_only_untraced() {
        let clients = sample().collect_service_clients();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].service, "users");
        assert_eq!(clients[0].url, "/users");
        assert_eq!(clients[0].client_type, "mysql");
        assert_eq!(clients[0].duration_ns, 2_000_000);
        assert_eq!(clients[0].trace_id, "trace-1");
        assert_eq!(clients[0].timestamp_ns, 50);
    }

    #[test]
    fn test_single_node_has_no_edges() {
        let relation = Relation {
            trace_id: "t".to_string(),
            root: RelationNode::default(),
        };
        assert!(relation.miss_top());
        assert!(relation.collect_relationships().is_empty());
        assert!(relation.collect_service_clients().is_empty());
    }
}
