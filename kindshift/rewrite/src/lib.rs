//! Pure payload rewriting for the kindshift proxy.
//!
//! Given a [`RuleTable`](kindshift_rules::RuleTable), an
//! [`Action`](kindshift_rules::Action) and a byte payload, the engine produces
//! a transformed payload. It understands four payload shapes (single object,
//! `*List` envelope, RFC 6902 patch array, watch event) and never needs
//! network access or mutable state.
//!
//! "This object has no rule" is not an error: it is the explicit
//! [`RewriteOutcome::Skipped`] variant, which callers must treat as "omit this
//! one item", never as "abort the operation".

mod engine;
mod error;
mod patch;

pub use engine::{
    rewrite_admission_review, rewrite_bookmark, rewrite_json_payload, rewrite_watch_event,
    PayloadKind,
};
pub use error::{Result, RewriteError};
pub use kindshift_rules::Action;
pub use patch::{escape_pointer_token, rewrite_patch, unescape_pointer_token};

/// Result of a rewrite that completed without a hard failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// The transformed payload.
    Rewritten(Vec<u8>),
    /// The payload's identity matches no rule under the requested action;
    /// the caller should drop (or forward untouched) exactly this one item.
    Skipped,
}

#[cfg(test)]
pub(crate) mod test_support {
    use kindshift_rules::{GroupRule, RenamePrefixes, ResourceRule, RuleTable};

    pub fn table() -> RuleTable {
        let table = RuleTable {
            prefixes: RenamePrefixes {
                kind: "Shifted".into(),
                resource: "shifted".into(),
                short_name: "x".into(),
                category: "shifted".into(),
            },
            groups: vec![GroupRule {
                group: "virt.example.io".into(),
                renamed: "internal.platform.example.io".into(),
                versions: vec!["v1".into()],
                preferred_version: "v1".into(),
                resources: vec![
                    ResourceRule {
                        kind: "Machine".into(),
                        list_kind: "MachineList".into(),
                        plural: "machines".into(),
                        singular: "machine".into(),
                        versions: vec!["v1".into()],
                        preferred_version: "v1".into(),
                        categories: vec!["all".into()],
                        short_names: vec!["vm".into()],
                    },
                    ResourceRule {
                        kind: "Disk".into(),
                        list_kind: "DiskList".into(),
                        plural: "disks".into(),
                        singular: "disk".into(),
                        versions: vec!["v1".into()],
                        preferred_version: "v1".into(),
                        categories: vec![],
                        short_names: vec![],
                    },
                ],
            }],
            webhooks: vec![],
        };
        table.validate().expect("test table is valid");
        table
    }
}
