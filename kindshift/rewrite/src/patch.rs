//! RFC 6902 JSON Patch rewriting.
//!
//! PATCH bodies are arrays of `{op, path, value}` operations, structurally
//! nothing like a resource object, so they get their own entry point. Two
//! things in a patch can carry renamed identity: a `path` pointing at a
//! label/annotation key (JSON-Pointer escaped), and a `value` that is itself a
//! full object or an array of objects.

use kindshift_rules::{Action, RuleTable};
use serde_json::Value;

use crate::{
    engine::rewrite_embedded_value,
    error::{Result, RewriteError},
    RewriteOutcome,
};

const LABEL_PATH_PREFIXES: [&str; 2] = ["/metadata/labels/", "/metadata/annotations/"];

/// Applies JSON-Pointer escaping to one reference token (RFC 6901): `~` must
/// be escaped before `/` so that `~1` in the input never doubles up.
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Removes JSON-Pointer escaping from one reference token; `~1` is resolved
/// before `~0`, the reverse of escaping.
pub fn unescape_pointer_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Rewrites an RFC 6902 patch document. Operation order is preserved; ops
/// whose path and value carry no renamed identity come out untouched.
pub fn rewrite_patch(rules: &RuleTable, action: Action, payload: &[u8]) -> Result<RewriteOutcome> {
    let mut value: Value = serde_json::from_slice(payload)?;

    let ops = value.as_array_mut().ok_or(RewriteError::UnexpectedShape {
        expected: "a JSON Patch array",
    })?;

    for op in ops.iter_mut() {
        let op = op.as_object_mut().ok_or(RewriteError::UnexpectedShape {
            expected: "a JSON Patch array",
        })?;

        if let Some(path) = op.get("path").and_then(Value::as_str) {
            if let Some(mapped) = rewrite_label_path(rules, action, path) {
                op.insert("path".into(), Value::String(mapped));
            }
        }

        if let Some(patched) = op.get_mut("value") {
            rewrite_embedded_value(rules, action, patched)?;
        }
    }

    Ok(RewriteOutcome::Rewritten(serde_json::to_vec(&value)?))
}

/// Maps a patch path of the form `/metadata/labels/<escaped-key>`. The key
/// token is unescaped before the rule lookup and re-escaped after, so `~0`/
/// `~1` sequences survive the round trip.
fn rewrite_label_path(rules: &RuleTable, action: Action, path: &str) -> Option<String> {
    for prefix in LABEL_PATH_PREFIXES {
        let Some(token) = path.strip_prefix(prefix) else {
            continue;
        };
        // Deeper pointers are not label keys.
        if token.is_empty() || token.contains('/') {
            return None;
        }

        let key = unescape_pointer_token(token);
        let mapped = rules.map_label_key(action, &key)?;
        return Some(format!("{prefix}{}", escape_pointer_token(&mapped)));
    }

    None
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::test_support;

    fn rewrite(action: Action, patch: &Value) -> Value {
        let payload = serde_json::to_vec(patch).unwrap();
        match rewrite_patch(&test_support::table(), action, &payload).unwrap() {
            RewriteOutcome::Rewritten(bytes) => serde_json::from_slice(&bytes).unwrap(),
            RewriteOutcome::Skipped => panic!("patch rewriting never skips"),
        }
    }

    #[rstest]
    #[case("app.kubernetes.io/managed-by", "app.kubernetes.io~1managed-by")]
    #[case("weird~key", "weird~0key")]
    #[case("both/and~", "both~1and~0")]
    fn pointer_tokens_round_trip(#[case] key: &str, #[case] escaped: &str) {
        assert_eq!(escape_pointer_token(key), escaped);
        assert_eq!(unescape_pointer_token(escaped), key);
    }

    #[test]
    fn rewrites_group_scoped_label_paths() {
        let patch = json!([
            { "op": "replace", "path": "/metadata/labels/virt.example.io~1os", "value": "bsd" }
        ]);

        let renamed = rewrite(Action::Rename, &patch);
        assert_eq!(
            renamed[0]["path"],
            "/metadata/labels/internal.platform.example.io~1os"
        );
        assert_eq!(renamed[0]["value"], "bsd");
    }

    #[test]
    fn label_drop_patch_survives_untouched() {
        // A patch dropping two vendor labels: neither key is group-scoped, so
        // the document must come out exactly as it went in, escaping intact.
        let patch = json!([
            { "op": "remove", "path": "/metadata/labels/app.kubernetes.io~1managed-by",
              "value": null },
            { "op": "remove", "path": "/metadata/labels/heritage", "value": null }
        ]);

        let rewritten = rewrite(Action::Rename, &patch);
        assert_eq!(rewritten, patch);

        let ops = rewritten.as_array().unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0]["op"], "remove");
        assert_eq!(
            ops[0]["path"],
            "/metadata/labels/app.kubernetes.io~1managed-by"
        );
        assert_eq!(ops[1]["path"], "/metadata/labels/heritage");
    }

    #[test]
    fn rewrites_full_object_values() {
        let patch = json!([
            {
                "op": "add",
                "path": "/spec/template",
                "value": {
                    "apiVersion": "virt.example.io/v1",
                    "kind": "Machine",
                    "metadata": { "name": "inner" }
                }
            },
            {
                "op": "add",
                "path": "/spec/disks",
                "value": [
                    { "apiVersion": "virt.example.io/v1", "kind": "Disk",
                      "metadata": { "name": "d0" } },
                    { "apiVersion": "v1", "kind": "ConfigMap",
                      "metadata": { "name": "unmapped" } }
                ]
            },
            { "op": "replace", "path": "/spec/cpus", "value": 8 }
        ]);

        let renamed = rewrite(Action::Rename, &patch);

        assert_eq!(renamed[0]["value"]["kind"], "ShiftedMachine");
        assert_eq!(
            renamed[0]["value"]["apiVersion"],
            "internal.platform.example.io/v1"
        );
        assert_eq!(renamed[1]["value"][0]["kind"], "ShiftedDisk");
        // Unmapped value objects pass through rather than being dropped; a
        // patch with a hole in it would not apply.
        assert_eq!(renamed[1]["value"][1]["kind"], "ConfigMap");
        assert_eq!(renamed[2]["value"], 8);
    }

    #[test]
    fn preserves_operation_order() {
        let patch = json!([
            { "op": "test", "path": "/metadata/name", "value": "vm-1" },
            { "op": "remove", "path": "/metadata/labels/heritage" },
            { "op": "add", "path": "/metadata/labels/fresh", "value": "yes" }
        ]);

        let rewritten = rewrite(Action::Rename, &patch);
        let ops: Vec<&str> = rewritten
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["op"].as_str().unwrap())
            .collect();
        assert_eq!(ops, ["test", "remove", "add"]);
    }

    #[test]
    fn non_array_body_is_a_shape_error() {
        let result = rewrite_patch(
            &test_support::table(),
            Action::Rename,
            br#"{"op": "remove"}"#,
        );
        assert!(matches!(
            result,
            Err(RewriteError::UnexpectedShape { .. })
        ));
    }
}
