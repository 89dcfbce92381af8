//! Two-pass BFS pattern inference (§4.H), grounded on
//! `restful_finder.go`'s `ScanRestfulPatternWithLabel`.
//!
//! Pass one (`measure`) walks the tree breadth-first and, for every node,
//! records under its *parent's* ancestor path which child name (or leaf
//! sentinel `""`) it produces. Siblings that disagree on their own name
//! but agree on the next hop land in the same bucket — that agreement is
//! what makes `/users/1/profile`, `/users/2/profile`, ... look like a
//! single templated path instead of N distinct ones.
//!
//! Pass two (`rewrite`) walks the tree again and substitutes `*` for a
//! node's own name whenever its bucket (keyed by its actual ancestor path)
//! has at least `threshold` members agreeing on the hop being taken.

use std::collections::{HashMap, VecDeque};

use super::arena::{Arena, NodeId};

/// A discovered (or passed-through) URL, tagged with the label it was
/// recorded under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlWithLabel {
    pub label: String,
    pub url: String,
}

/// `checkMap[ancestor_path][child_name_or_leaf] -> sibling nodes`.
type CheckMap = HashMap<String, HashMap<String, Vec<NodeId>>>;

pub fn measure(arena: &Arena, head: NodeId) -> CheckMap {
    let mut check_map: CheckMap = HashMap::new();
    let mut queue: VecDeque<(NodeId, Vec<String>)> = VecDeque::new();
    queue.push_back((head, Vec::new()));

    while let Some((id, pre_url)) = queue.pop_front() {
        let children = arena.children_snapshot(id);
        let name = arena.name(id);

        for &child_id in children.values() {
            let mut next_pre = pre_url.clone();
            next_pre.push(name.clone());
            queue.push_back((child_id, next_pre));
        }

        if arena.parent(id).is_none() {
            continue;
        }

        let key = pre_url.join("/");
        let bucket = check_map.entry(key).or_default();
        if children.is_empty() {
            bucket.entry(String::new()).or_default().push(id);
        }
        for child_name in children.keys() {
            bucket.entry(child_name.clone()).or_default().push(id);
        }
    }

    check_map
}

#[allow(clippy::too_many_arguments)]
pub fn rewrite(
    arena: &Arena,
    label: &str,
    head: NodeId,
    check_map: &CheckMap,
    threshold: usize,
    result_map: &mut HashMap<String, UrlWithLabel>,
    normal_list: &mut Vec<UrlWithLabel>,
) {
    let mut queue: VecDeque<(NodeId, Vec<String>, Vec<String>)> = VecDeque::new();
    queue.push_back((head, Vec::new(), Vec::new()));

    while let Some((id, pre_url, ori_url)) = queue.pop_front() {
        let children = arena.children_snapshot(id);
        let name = arena.name(id);

        if children.is_empty() {
            let key = ori_url.join("/");
            let is_wildcard_leaf = check_map
                .get(&key)
                .and_then(|bucket| bucket.get(""))
                .is_some_and(|siblings| siblings.len() >= threshold);
            let leaf_name = if is_wildcard_leaf { "*".to_string() } else { name.clone() };

            let mut final_url = pre_url.clone();
            final_url.push(leaf_name);
            let formatted = format!("/{}", final_url.join("/"));
            let dedup_key = format!("{label}-{formatted}");
            let has_wildcard = final_url.iter().any(|segment| segment == "*");

            if has_wildcard {
                result_map.entry(dedup_key).or_insert_with(|| UrlWithLabel {
                    label: label.to_string(),
                    url: formatted.clone(),
                });
            } else if !result_map.contains_key(&dedup_key) {
                normal_list.push(UrlWithLabel {
                    label: label.to_string(),
                    url: formatted,
                });
            }
        }

        let ancestor_key = ori_url.join("/");
        let bucket = check_map.get(&ancestor_key);
        for (child_name, &child_id) in &children {
            let is_wildcard_parent = bucket.is_some_and(|b| {
                b.get(child_name.as_str())
                    .is_some_and(|siblings| siblings.len() >= threshold)
            });
            let own_name = if is_wildcard_parent { "*".to_string() } else { name.clone() };

            let mut next_pre = pre_url.clone();
            next_pre.push(own_name);
            let mut next_ori = ori_url.clone();
            next_ori.push(name.clone());
            queue.push_back((child_id, next_pre, next_ori));
        }
    }
}
