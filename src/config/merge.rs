//! Layer merge: objects deep-merge by key, arrays and scalars are replaced.

use serde_json::{Map, Value};

/// Folds `overlay` into `target`. The overlay wins every conflict, an
/// explicit `null` included.
pub fn merge_into(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            merge_maps(target_map, overlay_map)
        }
        // A later prefix or argv list replaces the earlier one whole
        (slot, overlay) => *slot = overlay,
    }
}

fn merge_maps(target: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match target.get_mut(&key) {
            Some(existing) => merge_into(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

/// Owned form of [`merge_into`].
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

/// Builtin layer first, CLI overrides last.
pub fn merge_layers(layers: Vec<Value>) -> Value {
    let mut merged = Value::Null;
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_later_pass_budget_wins() {
        let merged = deep_merge(json!({"max_passes": 5}), json!({"max_passes": 3}));
        assert_eq!(merged["max_passes"], 3);
    }

    #[test]
    fn test_timeouts_merge_per_field() {
        let mut target = json!({"timeouts": {"invocation_seconds": 300, "overall_seconds": 595}});
        merge_into(&mut target, json!({"timeouts": {"overall_seconds": 900}}));

        assert_eq!(target["timeouts"]["overall_seconds"], 900);
        assert_eq!(target["timeouts"]["invocation_seconds"], 300);
    }

    #[test]
    fn test_prefix_list_is_replaced() {
        let base = json!({"sandbox": {"toolchain_prefixes": ["/usr/local/texlive", "/opt/texlive"]}});
        let overlay = json!({"sandbox": {"toolchain_prefixes": ["/srv/tl"]}});
        let merged = deep_merge(base, overlay);

        assert_eq!(merged["sandbox"]["toolchain_prefixes"], json!(["/srv/tl"]));
    }

    #[test]
    fn test_new_section_is_added() {
        let merged = deep_merge(json!({"jobs": 4}), json!({"fixups": {"enabled": true}}));
        assert_eq!(merged["jobs"], 4);
        assert_eq!(merged["fixups"]["enabled"], true);
    }

    #[test]
    fn test_null_clears_value() {
        let merged = deep_merge(json!({"sandbox": {"uid": 65534}}), json!({"sandbox": {"uid": null}}));
        assert!(merged["sandbox"]["uid"].is_null());
    }

    #[test]
    fn test_four_layers_in_precedence_order() {
        let builtin = json!({"max_passes": 5, "engines": {"pdflatex": "pdflatex", "bibtex": "bibtex"}});
        let host = json!({"max_passes": 4, "engines": {"pdflatex": "/opt/tl/bin/pdflatex"}});
        let submission = json!({"engines": {"bibtex": "bibtex8"}});
        let cli = json!({"max_passes": 2});

        let merged = merge_layers(vec![builtin, host, submission, cli]);

        assert_eq!(merged["max_passes"], 2);
        assert_eq!(merged["engines"]["pdflatex"], "/opt/tl/bin/pdflatex");
        assert_eq!(merged["engines"]["bibtex"], "bibtex8");
    }
}
