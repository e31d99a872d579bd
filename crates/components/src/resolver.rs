use alfred_core::Registry;
use std::collections::HashSet;

fn deps_of<'r>(registry: &'r Registry, id: &str) -> &'r [String] {
    registry
        .get(id)
        .map(|r| r.dependencies.as_slice())
        .unwrap_or(&[])
}

/// Dependency closure of `root`, dependencies before their dependents,
/// excluding `root` itself.
///
/// Returns `None` when `root` is unknown or the graph reachable from it has a
/// cycle. Dependencies missing from the registry are listed as leaves.
pub fn resolve(registry: &Registry, root: &str) -> Option<Vec<String>> {
    if !registry.contains(root) {
        return None;
    }

    let mut in_progress: HashSet<String> = HashSet::new();
    let mut done: HashSet<String> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(String, usize)> = vec![(root.to_string(), 0)];
    in_progress.insert(root.to_string());

    while let Some(top) = stack.last_mut() {
        let deps = deps_of(registry, &top.0);
        if top.1 < deps.len() {
            let dep = deps[top.1].clone();
            top.1 += 1;
            if in_progress.contains(&dep) {
                return None;
            }
            if done.contains(&dep) {
                continue;
            }
            in_progress.insert(dep.clone());
            stack.push((dep, 0));
        } else if let Some((node, _)) = stack.pop() {
            in_progress.remove(&node);
            if node != root {
                order.push(node.clone());
            }
            done.insert(node);
        }
    }

    Some(order)
}
