// restorer/src/ordering.rs
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyOrder {
    pub insert_order: Vec<String>,
    pub delete_order: Vec<String>,
}

/// Orders the distinct types of a snapshot for restore.
///
/// Prioritized types come first, in priority order. Types missing from the
/// priority table follow in the order they were first encountered, so every
/// known dependency is satisfied before them. Deletion is the exact reverse.
pub fn order(priority: &[&str], distinct_types: &[String]) -> DependencyOrder {
    let present: HashSet<&str> = distinct_types.iter().map(String::as_str).collect();
    let prioritized: HashSet<&str> = priority.iter().copied().collect();

    let mut insert_order: Vec<String> = priority
        .iter()
        .filter(|name| present.contains(*name))
        .map(|name| name.to_string())
        .collect();

    let mut deferred = HashSet::new();
    for entity_type in distinct_types {
        if !prioritized.contains(entity_type.as_str()) && deferred.insert(entity_type.as_str()) {
            insert_order.push(entity_type.clone());
        }
    }

    let delete_order = insert_order.iter().rev().cloned().collect();
    DependencyOrder {
        insert_order,
        delete_order,
    }
}
