//! Node arena backing the RESTful pattern tree.
//!
//! The source (`restful_finder.go`) links nodes with a raw `pre *node`
//! pointer that a node-creation race can leave pointing at the wrong
//! parent (`doingNode = nextNode; preNode = doingNode` reassigns `preNode`
//! from the node that was just *entered*, not the one that was just
//! *left*, so a child created two levels deep inherits its grandparent's
//! sibling as `pre` under concurrent writers). An arena with `NodeId`
//! indices sidesteps the bug entirely: a node's parent is recorded once,
//! at allocation time, and is never reassigned.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

pub type NodeId = usize;

struct NodeData {
    name: String,
    parent: Option<NodeId>,
    children: Mutex<HashMap<String, NodeId>>,
}

#[derive(Default)]
pub struct Arena {
    nodes: RwLock<Vec<NodeData>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&self, name: String, parent: Option<NodeId>) -> NodeId {
        let mut nodes = self.nodes.write();
        let id = nodes.len();
        nodes.push(NodeData {
            name,
            parent,
            children: Mutex::new(HashMap::new()),
        });
        id
    }

    pub fn name(&self, id: NodeId) -> String {
        self.nodes.read()[id].name.clone()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.read()[id].parent
    }

    pub fn children_snapshot(&self, id: NodeId) -> HashMap<String, NodeId> {
        self.nodes.read()[id].children.lock().clone()
    }

    /// Get-or-create the child named `child_name` under `id`, matching the
    /// source's `doingNode.next.lock`-guarded load-or-store. Two concurrent
    /// callers racing to create the same child may each allocate a node,
    /// but only one wins the insert; the loser's allocation is simply never
    /// referenced by any parent's children map and is harmless arena slack.
    pub fn get_or_insert_child(&self, id: NodeId, child_name: &str) -> NodeId {
        {
            let nodes = self.nodes.read();
            let children = nodes[id].children.lock();
            if let Some(&existing) = children.get(child_name) {
                return existing;
            }
        }
        let candidate = self.alloc(child_name.to_string(), Some(id));
        let nodes = self.nodes.read();
        let mut children = nodes[id].children.lock();
        *children.entry(child_name.to_string()).or_insert(candidate)
    }
}
