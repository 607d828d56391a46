use kindshift_rules::{Action, RuleTable};
use serde_json::{Map, Value};

use crate::{
    error::{Result, RewriteError},
    RewriteOutcome,
};

/// Watch event type whose object is a bare resource-version checkpoint.
const BOOKMARK: &str = "BOOKMARK";
/// Watch event type whose object is a `Status`, not a renamed resource.
const ERROR: &str = "ERROR";

/// Payload shape, classified once per payload before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A single resource object.
    Object,
    /// A `*List` envelope with an `items` array.
    List,
    /// An RFC 6902 patch document.
    PatchArray,
    /// A `{"type": ..., "object": ...}` watch event.
    WatchEvent,
}

impl PayloadKind {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::Array(_) => Self::PatchArray,
            Value::Object(obj) => {
                if obj.get("type").is_some_and(Value::is_string)
                    && obj.contains_key("object")
                    && !obj.contains_key("kind")
                {
                    Self::WatchEvent
                } else if obj
                    .get("kind")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| kind.ends_with("List"))
                    && obj.get("items").is_some_and(Value::is_array)
                {
                    Self::List
                } else {
                    Self::Object
                }
            }
            _ => Self::Object,
        }
    }
}

/// General rewrite entry for GET/LIST/POST/PUT bodies.
///
/// PATCH bodies are structurally different and must go through
/// [`rewrite_patch`](crate::rewrite_patch) instead; handing an array to this
/// entry is a shape error, not a silently wrong parse.
pub fn rewrite_json_payload(
    rules: &RuleTable,
    action: Action,
    payload: &[u8],
) -> Result<RewriteOutcome> {
    let mut value: Value = serde_json::from_slice(payload)?;

    let outcome = match PayloadKind::classify(&value) {
        PayloadKind::PatchArray => {
            return Err(RewriteError::UnexpectedShape {
                expected: "a resource object",
            })
        }
        PayloadKind::WatchEvent => return rewrite_watch_event(rules, action, payload),
        PayloadKind::List => rewrite_list(rules, action, &mut value)?,
        PayloadKind::Object => rewrite_object(rules, action, &mut value)?,
    };

    match outcome {
        ObjectOutcome::Rewritten => Ok(RewriteOutcome::Rewritten(serde_json::to_vec(&value)?)),
        ObjectOutcome::Skipped => Ok(RewriteOutcome::Skipped),
    }
}

/// Rewrites one framed watch event.
///
/// Non-bookmark events run their embedded object through the full object
/// rewrite; bookmark events only carry a resource-version checkpoint and take
/// the narrow path; error events embed a `Status` and pass through untouched.
pub fn rewrite_watch_event(
    rules: &RuleTable,
    action: Action,
    payload: &[u8],
) -> Result<RewriteOutcome> {
    let mut value: Value = serde_json::from_slice(payload)?;

    let event = value
        .as_object_mut()
        .ok_or(RewriteError::UnexpectedShape {
            expected: "a watch event",
        })?;
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .ok_or(RewriteError::UnexpectedShape {
            expected: "a watch event",
        })?
        .to_owned();

    if event_type == ERROR {
        return Ok(RewriteOutcome::Rewritten(payload.to_vec()));
    }

    let object = event
        .get_mut("object")
        .ok_or(RewriteError::UnexpectedShape {
            expected: "a watch event",
        })?;

    if event_type == BOOKMARK {
        rewrite_bookmark_object(rules, action, object);
    } else {
        match rewrite_object(rules, action, object)? {
            ObjectOutcome::Rewritten => {}
            ObjectOutcome::Skipped => return Ok(RewriteOutcome::Skipped),
        }
    }

    Ok(RewriteOutcome::Rewritten(serde_json::to_vec(&value)?))
}

/// Narrow entry for bookmark objects: fixes `apiVersion`/`kind` and nothing
/// else, tolerating a mostly-empty object. Unmapped bookmarks pass through.
pub fn rewrite_bookmark(rules: &RuleTable, action: Action, payload: &[u8]) -> Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(payload)?;
    rewrite_bookmark_object(rules, action, &mut value);
    Ok(serde_json::to_vec(&value)?)
}

fn rewrite_bookmark_object(rules: &RuleTable, action: Action, value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    let Some(kind) = obj.get("kind").and_then(Value::as_str).map(str::to_owned) else {
        return;
    };
    let api_version = api_version_of(obj);

    let Some(rule) = rules.find_for_object(action, api_version.as_deref(), &kind) else {
        return;
    };

    let new_kind = mapped_kind(rules, action, &rule);
    obj.insert("kind".into(), Value::String(new_kind));
    rewrite_api_version(rules, action, obj);
}

/// Internal per-object result; the object is mutated in place on success.
enum ObjectOutcome {
    Rewritten,
    Skipped,
}

fn rewrite_object(rules: &RuleTable, action: Action, value: &mut Value) -> Result<ObjectOutcome> {
    let obj = value.as_object_mut().ok_or(RewriteError::UnexpectedShape {
        expected: "a resource object",
    })?;

    let Some(kind) = obj.get("kind").and_then(Value::as_str).map(str::to_owned) else {
        return Ok(ObjectOutcome::Skipped);
    };
    let api_version = api_version_of(obj);

    let Some(rule) = rules.find_for_object(action, api_version.as_deref(), &kind) else {
        return Ok(ObjectOutcome::Skipped);
    };

    let new_kind = mapped_kind(rules, action, &rule);
    obj.insert("kind".into(), Value::String(new_kind));
    rewrite_api_version(rules, action, obj);
    rewrite_metadata(rules, action, obj);

    Ok(ObjectOutcome::Rewritten)
}

fn rewrite_list(rules: &RuleTable, action: Action, value: &mut Value) -> Result<ObjectOutcome> {
    match rewrite_object(rules, action, value)? {
        ObjectOutcome::Skipped => return Ok(ObjectOutcome::Skipped),
        ObjectOutcome::Rewritten => {}
    }

    // Envelope matched, now each item on its own; skipped items are omitted,
    // the order of the rest is preserved.
    let obj = value.as_object_mut().ok_or(RewriteError::UnexpectedShape {
        expected: "a list object",
    })?;
    if let Some(Value::Array(items)) = obj.get_mut("items") {
        let mut kept = Vec::with_capacity(items.len());
        for mut item in items.drain(..) {
            match rewrite_object(rules, action, &mut item)? {
                ObjectOutcome::Rewritten => kept.push(item),
                ObjectOutcome::Skipped => {}
            }
        }
        *items = kept;
    }

    Ok(ObjectOutcome::Rewritten)
}

/// Rewrites the objects embedded in an `AdmissionReview` call.
///
/// The admission caller wraps the resource under review in
/// `request.object`/`request.oldObject`; the envelope itself keeps its own
/// identity. Unmapped embedded objects are left as they are.
pub fn rewrite_admission_review(
    rules: &RuleTable,
    action: Action,
    payload: &[u8],
) -> Result<RewriteOutcome> {
    let mut value: Value = serde_json::from_slice(payload)?;

    let review = value
        .as_object_mut()
        .ok_or(RewriteError::UnexpectedShape {
            expected: "an AdmissionReview",
        })?;

    let Some(Value::Object(request)) = review.get_mut("request") else {
        return Err(RewriteError::UnexpectedShape {
            expected: "an AdmissionReview",
        });
    };

    for field in ["object", "oldObject"] {
        if let Some(object) = request.get_mut(field) {
            rewrite_embedded_value(rules, action, object)?;
        }
    }

    Ok(RewriteOutcome::Rewritten(serde_json::to_vec(&value)?))
}

/// Rewrites a patch operation's `value` in place when it is a full object
/// (carries both `apiVersion` and `kind`) or an array of such objects.
///
/// Unmapped objects are left untouched rather than dropped; a patch document
/// with a hole in it would no longer apply.
pub(crate) fn rewrite_embedded_value(
    rules: &RuleTable,
    action: Action,
    value: &mut Value,
) -> Result<()> {
    if is_full_object(value) {
        let _ = rewrite_object(rules, action, value)?;
    } else if let Value::Array(items) = value {
        for item in items {
            if is_full_object(item) {
                let _ = rewrite_object(rules, action, item)?;
            }
        }
    }
    Ok(())
}

fn is_full_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("apiVersion") && obj.contains_key("kind"))
}

fn api_version_of(obj: &Map<String, Value>) -> Option<String> {
    obj.get("apiVersion")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn mapped_kind(
    rules: &RuleTable,
    action: Action,
    rule: &kindshift_rules::ObjectRule<'_>,
) -> String {
    let base = if rule.is_list {
        &rule.resource.list_kind
    } else {
        &rule.resource.kind
    };

    match action {
        Action::Rename => rules.renamed_kind(base),
        Action::Restore => base.clone(),
    }
}

fn rewrite_api_version(rules: &RuleTable, action: Action, obj: &mut Map<String, Value>) {
    let Some(api_version) = api_version_of(obj) else {
        return;
    };
    if let Some(mapped) = rules.map_api_version(action, &api_version) {
        obj.insert("apiVersion".into(), Value::String(mapped));
    }
}

fn rewrite_metadata(rules: &RuleTable, action: Action, obj: &mut Map<String, Value>) {
    let Some(Value::Object(metadata)) = obj.get_mut("metadata") else {
        return;
    };

    for field in ["labels", "annotations"] {
        if let Some(Value::Object(entries)) = metadata.get_mut(field) {
            let mut mapped = Map::new();
            for (key, value) in std::mem::take(entries) {
                let key = rules.map_label_key(action, &key).unwrap_or(key);
                mapped.insert(key, value);
            }
            *entries = mapped;
        }
    }

    if let Some(Value::Array(owners)) = metadata.get_mut("ownerReferences") {
        for owner in owners {
            rewrite_owner_reference(rules, action, owner);
        }
    }
}

fn rewrite_owner_reference(rules: &RuleTable, action: Action, owner: &mut Value) {
    let Some(obj) = owner.as_object_mut() else {
        return;
    };
    let Some(kind) = obj.get("kind").and_then(Value::as_str).map(str::to_owned) else {
        return;
    };
    let api_version = api_version_of(obj);

    // Owner references to resources outside the table stay untouched.
    let Some(rule) = rules.find_for_object(action, api_version.as_deref(), &kind) else {
        return;
    };

    let new_kind = mapped_kind(rules, action, &rule);
    obj.insert("kind".into(), Value::String(new_kind));
    rewrite_api_version(rules, action, obj);
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::test_support;

    fn machine() -> Value {
        json!({
            "apiVersion": "virt.example.io/v1",
            "kind": "Machine",
            "metadata": {
                "name": "vm-1",
                "namespace": "default",
                "labels": {
                    "app": "frontend",
                    "virt.example.io/os": "linux",
                    "app.kubernetes.io/managed-by": "Helm"
                },
                "annotations": {
                    "sub.virt.example.io/cpu": "4"
                },
                "ownerReferences": [
                    {
                        "apiVersion": "virt.example.io/v1",
                        "kind": "Disk",
                        "name": "disk-1",
                        "uid": "1234"
                    },
                    {
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "name": "owner",
                        "uid": "5678"
                    }
                ]
            },
            "spec": { "cpus": 4, "zone": "b" },
            "status": { "phase": "Running" }
        })
    }

    fn rewrite_value(action: Action, value: &Value) -> Value {
        let payload = serde_json::to_vec(value).unwrap();
        match rewrite_json_payload(&test_support::table(), action, &payload).unwrap() {
            RewriteOutcome::Rewritten(bytes) => serde_json::from_slice(&bytes).unwrap(),
            RewriteOutcome::Skipped => panic!("expected a rewrite, got a skip"),
        }
    }

    #[test]
    fn renames_identity_fields() {
        let renamed = rewrite_value(Action::Rename, &machine());

        assert_eq!(renamed["apiVersion"], "internal.platform.example.io/v1");
        assert_eq!(renamed["kind"], "ShiftedMachine");
        assert_eq!(
            renamed["metadata"]["labels"]["internal.platform.example.io/os"],
            "linux"
        );
        assert_eq!(
            renamed["metadata"]["labels"]["app.kubernetes.io/managed-by"],
            "Helm"
        );
        assert_eq!(
            renamed["metadata"]["annotations"]["sub.internal.platform.example.io/cpu"],
            "4"
        );
        assert_eq!(renamed["metadata"]["ownerReferences"][0]["kind"], "ShiftedDisk");
        // Owner reference outside the table is untouched.
        assert_eq!(renamed["metadata"]["ownerReferences"][1]["kind"], "Deployment");
        // Non-identity fields are untouched.
        assert_eq!(renamed["spec"], machine()["spec"]);
        assert_eq!(renamed["status"], machine()["status"]);
    }

    #[test]
    fn round_trips_identity() {
        let original = machine();
        let renamed = rewrite_value(Action::Rename, &original);
        let restored = rewrite_value(Action::Restore, &renamed);
        assert_eq!(restored, original);

        let renamed_again = rewrite_value(Action::Rename, &restored);
        assert_eq!(renamed_again, renamed);
    }

    #[test]
    fn preserves_sibling_order() {
        let payload = serde_json::to_vec(&machine()).unwrap();
        let rewritten =
            match rewrite_json_payload(&test_support::table(), Action::Rename, &payload).unwrap() {
                RewriteOutcome::Rewritten(bytes) => String::from_utf8(bytes).unwrap(),
                RewriteOutcome::Skipped => panic!("unexpected skip"),
            };

        // `app` came before the group-scoped key and must stay there; `spec`
        // must still precede `status`.
        let app = rewritten.find("\"app\"").unwrap();
        let os = rewritten.find("internal.platform.example.io/os").unwrap();
        let spec = rewritten.find("\"spec\"").unwrap();
        let status = rewritten.find("\"status\"").unwrap();
        assert!(app < os);
        assert!(spec < status);
    }

    #[test]
    fn rewrites_lists_in_order() {
        let list = json!({
            "apiVersion": "virt.example.io/v1",
            "kind": "MachineList",
            "metadata": { "resourceVersion": "100" },
            "items": [
                { "apiVersion": "virt.example.io/v1", "kind": "Machine",
                  "metadata": { "name": "a" } },
                { "apiVersion": "virt.example.io/v1", "kind": "Machine",
                  "metadata": { "name": "b" } },
                { "apiVersion": "virt.example.io/v1", "kind": "Machine",
                  "metadata": { "name": "c" } }
            ]
        });

        let renamed = rewrite_value(Action::Rename, &list);
        assert_eq!(renamed["kind"], "ShiftedMachineList");

        let items = renamed["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        for (item, name) in items.iter().zip(["a", "b", "c"]) {
            assert_eq!(item["kind"], "ShiftedMachine");
            assert_eq!(item["metadata"]["name"], name);
        }
    }

    #[test]
    fn list_omits_unmapped_items() {
        let list = json!({
            "apiVersion": "virt.example.io/v1",
            "kind": "MachineList",
            "items": [
                { "apiVersion": "virt.example.io/v1", "kind": "Machine",
                  "metadata": { "name": "a" } },
                { "apiVersion": "v1", "kind": "ConfigMap",
                  "metadata": { "name": "stray" } },
                { "apiVersion": "virt.example.io/v1", "kind": "Machine",
                  "metadata": { "name": "b" } }
            ]
        });

        let renamed = rewrite_value(Action::Rename, &list);
        let items = renamed["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["metadata"]["name"], "a");
        assert_eq!(items[1]["metadata"]["name"], "b");
    }

    #[test]
    fn unmapped_kind_is_skipped_not_failed() {
        let pod = json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" } });
        let payload = serde_json::to_vec(&pod).unwrap();
        let outcome =
            rewrite_json_payload(&test_support::table(), Action::Rename, &payload).unwrap();
        assert_eq!(outcome, RewriteOutcome::Skipped);
    }

    #[test]
    fn invalid_json_is_a_hard_error() {
        let result = rewrite_json_payload(&test_support::table(), Action::Rename, b"{not json");
        assert!(matches!(result, Err(RewriteError::InvalidJson(_))));
    }

    #[test]
    fn array_payload_is_a_shape_error() {
        let result = rewrite_json_payload(&test_support::table(), Action::Rename, b"[]");
        assert!(matches!(
            result,
            Err(RewriteError::UnexpectedShape { .. })
        ));
    }

    #[rstest]
    #[case("ADDED")]
    #[case("MODIFIED")]
    #[case("DELETED")]
    fn restores_watch_events(#[case] event_type: &str) {
        let event = json!({
            "type": event_type,
            "object": {
                "apiVersion": "internal.platform.example.io/v1",
                "kind": "ShiftedMachine",
                "metadata": { "name": "vm-1", "resourceVersion": "7" }
            }
        });
        let payload = serde_json::to_vec(&event).unwrap();

        let outcome =
            rewrite_watch_event(&test_support::table(), Action::Restore, &payload).unwrap();
        let RewriteOutcome::Rewritten(bytes) = outcome else {
            panic!("unexpected skip");
        };
        let restored: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(restored["type"], event_type);
        assert_eq!(restored["object"]["kind"], "Machine");
        assert_eq!(restored["object"]["apiVersion"], "virt.example.io/v1");
        assert_eq!(restored["object"]["metadata"]["resourceVersion"], "7");
    }

    #[test]
    fn watch_event_with_unmapped_object_is_skipped() {
        let event = json!({
            "type": "ADDED",
            "object": { "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" } }
        });
        let payload = serde_json::to_vec(&event).unwrap();
        let outcome =
            rewrite_watch_event(&test_support::table(), Action::Restore, &payload).unwrap();
        assert_eq!(outcome, RewriteOutcome::Skipped);
    }

    #[test]
    fn error_events_pass_through() {
        let event = json!({
            "type": "ERROR",
            "object": { "kind": "Status", "apiVersion": "v1", "code": 410 }
        });
        let payload = serde_json::to_vec(&event).unwrap();
        let outcome =
            rewrite_watch_event(&test_support::table(), Action::Restore, &payload).unwrap();
        assert_eq!(outcome, RewriteOutcome::Rewritten(payload));
    }

    #[test]
    fn bookmark_tolerates_minimal_object() {
        let bookmark = json!({
            "kind": "ShiftedMachine",
            "apiVersion": "internal.platform.example.io/v1",
            "metadata": { "resourceVersion": "12345" }
        });
        let payload = serde_json::to_vec(&bookmark).unwrap();

        let restored =
            rewrite_bookmark(&test_support::table(), Action::Restore, &payload).unwrap();
        let restored: Value = serde_json::from_slice(&restored).unwrap();
        assert_eq!(restored["kind"], "Machine");
        assert_eq!(restored["apiVersion"], "virt.example.io/v1");
        assert_eq!(restored["metadata"]["resourceVersion"], "12345");

        // An empty object is not an error.
        let empty = rewrite_bookmark(&test_support::table(), Action::Restore, b"{}").unwrap();
        assert_eq!(empty, b"{}");
    }

    #[test]
    fn restores_admission_review_objects() {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "req-1",
                "object": {
                    "apiVersion": "internal.platform.example.io/v1",
                    "kind": "ShiftedMachine",
                    "metadata": { "name": "vm-1" }
                },
                "oldObject": null
            }
        });
        let payload = serde_json::to_vec(&review).unwrap();

        let RewriteOutcome::Rewritten(bytes) =
            rewrite_admission_review(&test_support::table(), Action::Restore, &payload).unwrap()
        else {
            panic!("unexpected skip");
        };
        let restored: Value = serde_json::from_slice(&bytes).unwrap();

        // The envelope keeps its own identity, only the payload object moves.
        assert_eq!(restored["kind"], "AdmissionReview");
        assert_eq!(restored["request"]["object"]["kind"], "Machine");
        assert_eq!(
            restored["request"]["object"]["apiVersion"],
            "virt.example.io/v1"
        );
        assert_eq!(restored["request"]["uid"], "req-1");
    }

    #[test]
    fn classifies_payload_shapes() {
        assert_eq!(PayloadKind::classify(&json!([])), PayloadKind::PatchArray);
        assert_eq!(
            PayloadKind::classify(&json!({ "type": "ADDED", "object": {} })),
            PayloadKind::WatchEvent
        );
        assert_eq!(
            PayloadKind::classify(&json!({ "kind": "MachineList", "items": [] })),
            PayloadKind::List
        );
        // A list kind without items is still a plain object.
        assert_eq!(
            PayloadKind::classify(&json!({ "kind": "MachineList" })),
            PayloadKind::Object
        );
        assert_eq!(
            PayloadKind::classify(&json!({ "kind": "Machine" })),
            PayloadKind::Object
        );
    }
}
