//! Static rename rules for the kindshift proxy.
//!
//! A [`RuleTable`] describes how resource identity (API group, kind,
//! plural/singular/short names, categories) maps between its original and
//! renamed form, plus which admission-webhook paths are remapped. The table is
//! loaded once at startup, validated, and shared read-only for the lifetime of
//! the process.

mod error;
mod table;

pub use error::{Result, RulesError};
pub use table::{
    Action, GroupRule, ObjectRule, RenamePrefixes, ResourceRule, RuleTable, WebhookRule,
};
