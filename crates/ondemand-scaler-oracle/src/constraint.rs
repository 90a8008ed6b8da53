//! Constraint evaluation against node properties.

use std::cmp::Ordering;

use ondemand_scaler_core::{Constraint, Node};
use regex::Regex;

/// Resolve a constraint target against `node`.
///
/// Interpolated targets (`${attr.kernel.name}`, `${meta.rack}`,
/// `${node.datacenter}`, `${node.class}`, `${node.unique.id}`,
/// `${node.unique.name}`) resolve to the node's value or `None` when unset.
/// Anything else is a literal.
#[must_use]
pub fn resolve_target(target: &str, node: &Node) -> Option<String> {
    let Some(inner) = target
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Some(target.to_string());
    };

    if let Some(key) = inner.strip_prefix("attr.") {
        return node.attributes.get(key).cloned();
    }
    if let Some(key) = inner.strip_prefix("meta.") {
        return node.meta.get(key).cloned();
    }

    match inner {
        "node.datacenter" => Some(node.datacenter.clone()),
        "node.class" => Some(node.node_class.clone()),
        "node.unique.id" => Some(node.id.to_string()),
        "node.unique.name" => Some(node.name.clone()),
        _ => None,
    }
}

/// Whether `node` satisfies `constraint`.
///
/// Spread operators (`distinct_hosts`, `distinct_property`) do not affect
/// feasibility and always pass. Unknown operators fail.
#[must_use]
pub fn satisfies(constraint: &Constraint, node: &Node) -> bool {
    let lhs = resolve_target(&constraint.l_target, node);
    let rhs = resolve_target(&constraint.r_target, node);

    match constraint.operand.as_str() {
        "distinct_hosts" | "distinct_property" => true,
        "is_set" => lhs.is_some(),
        "is_not_set" => lhs.is_none(),
        "=" | "==" | "is" => matches!((&lhs, &rhs), (Some(l), Some(r)) if l == r),
        "!=" | "not" => lhs != rhs,
        "<" | "<=" | ">" | ">=" => match (&lhs, &rhs) {
            (Some(l), Some(r)) => {
                let ord = compare_values(l, r);
                match constraint.operand.as_str() {
                    "<" => ord == Ordering::Less,
                    "<=" => ord != Ordering::Greater,
                    ">" => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }
            }
            _ => false,
        },
        "regexp" => match (&lhs, &rhs) {
            (Some(l), Some(r)) => Regex::new(r).is_ok_and(|re| re.is_match(l)),
            _ => false,
        },
        "set_contains" | "set_contains_all" => match (&lhs, &rhs) {
            (Some(l), Some(r)) => {
                let have = split_set(l);
                split_set(r).iter().all(|want| have.contains(want))
            }
            _ => false,
        },
        "set_contains_any" => match (&lhs, &rhs) {
            (Some(l), Some(r)) => {
                let have = split_set(l);
                split_set(r).iter().any(|want| have.contains(want))
            }
            _ => false,
        },
        other => {
            tracing::debug!(operand = other, "unsupported constraint operand");
            false
        }
    }
}

/// Compare numerically when both sides parse as numbers, lexically otherwise.
fn compare_values(l: &str, r: &str) -> Ordering {
    match (l.trim().parse::<f64>(), r.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => l.cmp(r),
    }
}

fn split_set(s: &str) -> Vec<&str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ondemand_scaler_core::NodeId;

    fn node() -> Node {
        let mut node = Node::new(NodeId::new("n1"));
        node.datacenter = "dc1".into();
        node.node_class = "batch".into();
        node.attributes.insert("kernel.name".into(), "linux".into());
        node.attributes.insert("cpu.numcores".into(), "8".into());
        node.meta.insert("tags".into(), "ssd, fast,gpu".into());
        node
    }

    fn check(l: &str, op: &str, r: &str) -> bool {
        satisfies(&Constraint::new(l, op, r), &node())
    }

    #[test]
    fn resolves_interpolated_targets() {
        let n = node();
        assert_eq!(resolve_target("${attr.kernel.name}", &n).as_deref(), Some("linux"));
        assert_eq!(resolve_target("${node.datacenter}", &n).as_deref(), Some("dc1"));
        assert_eq!(resolve_target("${node.class}", &n).as_deref(), Some("batch"));
        assert_eq!(resolve_target("${meta.missing}", &n), None);
        assert_eq!(resolve_target("literal", &n).as_deref(), Some("literal"));
    }

    #[test]
    fn equality_operators() {
        assert!(check("${attr.kernel.name}", "=", "linux"));
        assert!(!check("${attr.kernel.name}", "=", "windows"));
        assert!(check("${attr.kernel.name}", "!=", "windows"));
        assert!(check("${attr.missing}", "!=", "x"));
    }

    #[test]
    fn numeric_comparison() {
        assert!(check("${attr.cpu.numcores}", ">=", "8"));
        assert!(!check("${attr.cpu.numcores}", ">", "10"));
        assert!(check("${attr.cpu.numcores}", "<", "10"));
    }

    #[test]
    fn regexp_and_sets() {
        assert!(check("${attr.kernel.name}", "regexp", "^lin"));
        assert!(!check("${attr.kernel.name}", "regexp", "[invalid"));
        assert!(check("${meta.tags}", "set_contains", "ssd,gpu"));
        assert!(!check("${meta.tags}", "set_contains", "ssd,nvme"));
        assert!(check("${meta.tags}", "set_contains_any", "nvme,gpu"));
    }

    #[test]
    fn presence_and_spread() {
        assert!(check("${meta.tags}", "is_set", ""));
        assert!(check("${meta.rack}", "is_not_set", ""));
        assert!(check("${meta.rack}", "distinct_hosts", ""));
        assert!(!check("${meta.rack}", "semver", ">= 1.0"));
    }
}
