use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{AccessPath, SSHKey, Server, UnreachableSource};
use crate::DbConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Server,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub ip_address: String,
    pub os_type: Option<String>,
    pub is_reachable: bool,
    pub key_count: i64,
    pub event_count: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GraphEdge {
    pub id: i32,
    pub source: String,
    pub target: String,
    pub label: String,
    pub ssh_key_id: Option<i32>,
    pub key_type: Option<String>,
    pub username: String,
    pub event_count: i32,
    pub is_active: bool,
    pub is_authorized: bool,
    pub is_used: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Authorization,
    Usage,
    All,
}

/// Projects persisted `Server`/`UnreachableSource`/`AccessPath` rows into
/// a node/edge graph, filtered by layer.
pub fn build_graph(conn: &mut DbConnection, layer: Layer) -> diesel::QueryResult<Graph> {
    let servers = Server::list_all(conn)?;
    let unreachable = UnreachableSource::all(conn)?;
    let paths = AccessPath::all(conn)?;
    let key_types: HashMap<i32, String> = SSHKey::all(conn)?.into_iter().map(|k| (k.id, k.key_type)).collect();

    let mut key_counts: HashMap<i32, i64> = HashMap::new();
    let mut event_counts: HashMap<i32, i64> = HashMap::new();
    for path in &paths {
        if let Some(target) = Some(path.target_server_id) {
            *event_counts.entry(target).or_insert(0) += path.event_count as i64;
        }
    }
    for server in &servers {
        let count = crate::models::KeyLocation::for_server(conn, server.id)?.len() as i64;
        key_counts.insert(server.id, count);
    }

    let mut nodes: Vec<GraphNode> = servers
        .iter()
        .map(|s| GraphNode {
            id: s.id.to_string(),
            label: s.hostname.clone(),
            node_type: NodeType::Server,
            ip_address: s.ip.clone(),
            os_type: Some(s.os_type.clone()),
            is_reachable: s.is_reachable,
            key_count: *key_counts.get(&s.id).unwrap_or(&0),
            event_count: *event_counts.get(&s.id).unwrap_or(&0),
        })
        .collect();

    nodes.extend(unreachable.iter().map(|u| GraphNode {
        id: format!("unreachable:{}", u.id),
        label: u.source_ip.clone(),
        node_type: NodeType::Unreachable,
        ip_address: u.source_ip.clone(),
        os_type: None,
        is_reachable: false,
        key_count: 0,
        event_count: u.event_count as i64,
    }));

    let edges: Vec<GraphEdge> = paths
        .iter()
        .filter(|p| match layer {
            Layer::Authorization => p.is_authorized,
            Layer::Usage => p.is_used,
            Layer::All => true,
        })
        .map(|p| GraphEdge {
            id: p.id,
            source: p
                .source_server_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_owned()),
            target: p.target_server_id.to_string(),
            label: p.username.clone(),
            ssh_key_id: p.ssh_key_id,
            key_type: p.ssh_key_id.and_then(|id| key_types.get(&id).cloned()),
            username: p.username.clone(),
            event_count: p.event_count,
            is_active: p.is_used,
            is_authorized: p.is_authorized,
            is_used: p.is_used,
        })
        .collect();

    let node_count = nodes.len();
    let edge_count = edges.len();
    Ok(Graph {
        nodes,
        edges,
        node_count,
        edge_count,
    })
}

/// BFS over `graph`'s edges from `start`, both directions, up to `depth` hops.
pub fn server_centered_subgraph(graph: &Graph, start: &str, depth: u32) -> Graph {
    let mut visited = HashSet::new();
    visited.insert(start.to_owned());
    let mut queue = VecDeque::new();
    queue.push_back((start.to_owned(), 0u32));

    let mut kept_nodes = HashSet::new();
    kept_nodes.insert(start.to_owned());

    while let Some((node, d)) = queue.pop_front() {
        if d >= depth {
            continue;
        }
        for edge in &graph.edges {
            let neighbor = if edge.source == node {
                Some(edge.target.clone())
            } else if edge.target == node {
                Some(edge.source.clone())
            } else {
                None
            };
            if let Some(neighbor) = neighbor {
                if visited.insert(neighbor.clone()) {
                    kept_nodes.insert(neighbor.clone());
                    queue.push_back((neighbor, d + 1));
                }
            }
        }
    }

    subgraph_for_nodes(graph, &kept_nodes)
}

/// All edges carrying `key_id` (an `AccessPath.ssh_key_id`) plus their
/// incident nodes.
pub fn key_centered_subgraph(graph: &Graph, key_id: i32) -> Graph {
    let edges: Vec<GraphEdge> = graph
        .edges
        .iter()
        .filter(|e| e.ssh_key_id == Some(key_id))
        .cloned()
        .collect();

    let mut kept_nodes = HashSet::new();
    for edge in &edges {
        kept_nodes.insert(edge.source.clone());
        kept_nodes.insert(edge.target.clone());
    }

    let node_count = kept_nodes.len();
    let edge_count = edges.len();
    Graph {
        nodes: graph
            .nodes
            .iter()
            .filter(|n| kept_nodes.contains(&n.id))
            .cloned()
            .collect(),
        edges,
        node_count,
        edge_count,
    }
}

/// Shortest path (fewest hops, ties broken by earliest `first_seen_at`
/// among the source `AccessPath` rows, pre-sorted by the caller) between
/// two nodes. Returns the node id sequence, or `None` if disconnected.
pub fn shortest_path(graph: &Graph, from: &str, to: &str) -> Option<Vec<String>> {
    if from == to {
        return Some(vec![from.to_owned()]);
    }

    let mut visited = HashSet::new();
    visited.insert(from.to_owned());
    let mut queue = VecDeque::new();
    queue.push_back(vec![from.to_owned()]);

    while let Some(path) = queue.pop_front() {
        let node = path.last()?.clone();
        for edge in &graph.edges {
            let neighbor = if edge.source == node {
                Some(edge.target.clone())
            } else if edge.target == node {
                Some(edge.source.clone())
            } else {
                None
            };
            if let Some(neighbor) = neighbor {
                if neighbor == to {
                    let mut full = path.clone();
                    full.push(neighbor);
                    return Some(full);
                }
                if visited.insert(neighbor.clone()) {
                    let mut extended = path.clone();
                    extended.push(neighbor);
                    queue.push_back(extended);
                }
            }
        }
    }

    None
}

fn subgraph_for_nodes(graph: &Graph, keep: &HashSet<String>) -> Graph {
    let nodes: Vec<GraphNode> = graph.nodes.iter().filter(|n| keep.contains(&n.id)).cloned().collect();
    let edges: Vec<GraphEdge> = graph
        .edges
        .iter()
        .filter(|e| keep.contains(&e.source) && keep.contains(&e.target))
        .cloned()
        .collect();
    let node_count = nodes.len();
    let edge_count = edges.len();
    Graph {
        nodes,
        edges,
        node_count,
        edge_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> Graph {
        let nodes = vec!["1", "2", "3"]
            .into_iter()
            .map(|id| GraphNode {
                id: id.to_owned(),
                label: id.to_owned(),
                node_type: NodeType::Server,
                ip_address: "10.0.0.1".to_owned(),
                os_type: Some("linux".to_owned()),
                is_reachable: true,
                key_count: 0,
                event_count: 0,
            })
            .collect();
        let edges = vec![
            GraphEdge {
                id: 1,
                source: "1".to_owned(),
                target: "2".to_owned(),
                label: "root".to_owned(),
                ssh_key_id: Some(10),
                key_type: Some("ed25519".to_owned()),
                username: "root".to_owned(),
                event_count: 1,
                is_active: true,
                is_authorized: true,
                is_used: true,
            },
            GraphEdge {
                id: 2,
                source: "2".to_owned(),
                target: "3".to_owned(),
                label: "root".to_owned(),
                ssh_key_id: Some(20),
                key_type: Some("rsa".to_owned()),
                username: "root".to_owned(),
                event_count: 1,
                is_active: true,
                is_authorized: true,
                is_used: true,
            },
        ];
        Graph {
            node_count: nodes.len(),
            edge_count: edges.len(),
            nodes,
            edges,
        }
    }

    #[test]
    fn finds_shortest_path() {
        let graph = sample_graph();
        let path = shortest_path(&graph, "1", "3").expect("path exists");
        assert_eq!(path, vec!["1".to_owned(), "2".to_owned(), "3".to_owned()]);
    }

    #[test]
    fn no_path_when_disconnected() {
        let mut graph = sample_graph();
        graph.edges.retain(|e| e.id != 2);
        assert!(shortest_path(&graph, "1", "3").is_none());
    }

    #[test]
    fn server_centered_respects_depth() {
        let graph = sample_graph();
        let sub = server_centered_subgraph(&graph, "1", 1);
        assert!(sub.nodes.iter().any(|n| n.id == "2"));
        assert!(!sub.nodes.iter().any(|n| n.id == "3"));
    }

    #[test]
    fn key_centered_subgraph_keys_by_id_not_label() {
        let graph = sample_graph();
        let sub = key_centered_subgraph(&graph, 10);
        assert_eq!(sub.edges.len(), 1);
        assert_eq!(sub.edges[0].id, 1);
        assert!(sub.nodes.iter().any(|n| n.id == "1"));
        assert!(sub.nodes.iter().any(|n| n.id == "2"));
        assert!(!sub.nodes.iter().any(|n| n.id == "3"));
    }

    #[test]
    fn key_centered_subgraph_empty_for_unknown_key() {
        let graph = sample_graph();
        let sub = key_centered_subgraph(&graph, 999);
        assert!(sub.edges.is_empty());
        assert!(sub.nodes.is_empty());
    }
}
