use std::{fs::File, io, path::Path};

use serde::Deserialize;

use crate::error::{Result, RulesError};

/// Direction of an identity rewrite.
///
/// Orthogonal to which side of the proxy an HTTP exchange is on: a request and
/// its response use opposite actions, picked per proxy instance by the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Original identity -> renamed identity.
    Rename,
    /// Renamed identity -> original identity.
    Restore,
}

/// Prefixes applied uniformly to every renamed resource, keeping the renamed
/// schema internally consistent.
#[derive(Debug, Clone, Deserialize)]
pub struct RenamePrefixes {
    /// Prepended to `kind` and `listKind` (CamelCase).
    pub kind: String,
    /// Prepended to plural and singular resource names (lowercase).
    pub resource: String,
    /// Prepended to every short name.
    pub short_name: String,
    /// Single category replacing the original category list.
    pub category: String,
}

/// One renamed resource within a [`GroupRule`].
///
/// All fields hold the *original* names; renamed counterparts are derived via
/// [`RenamePrefixes`], never stored.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceRule {
    pub kind: String,
    pub list_kind: String,
    pub plural: String,
    pub singular: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub preferred_version: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub short_names: Vec<String>,
}

/// Mapping of one original API group to its renamed counterpart.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupRule {
    /// Original group name, e.g. `virt.example.io`.
    pub group: String,
    /// Renamed group name, e.g. `internal.platform.example.io`.
    pub renamed: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub preferred_version: String,
    #[serde(default)]
    pub resources: Vec<ResourceRule>,
}

/// Remapping of one admission-webhook path.
///
/// The backend's API server calls the proxy on `path`; the proxy forwards to
/// the real webhook server on `target_path`.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRule {
    pub path: String,
    pub target_path: String,
    /// Original group of the resource under admission.
    pub group: String,
    /// Original resource type (plural) under admission.
    pub resource: String,
}

/// A resource rule matched for a concrete JSON object.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRule<'a> {
    pub group: &'a GroupRule,
    pub resource: &'a ResourceRule,
    /// Whether the object's kind matched the list kind rather than the kind.
    pub is_list: bool,
}

/// The full rename rule table. Immutable after [`RuleTable::validate`]; shared
/// read-only across all proxy exchanges.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleTable {
    pub prefixes: RenamePrefixes,
    pub groups: Vec<GroupRule>,
    #[serde(default)]
    pub webhooks: Vec<WebhookRule>,
}

impl RuleTable {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let table: Self = serde_yaml::from_reader(reader)?;
        table.validate()?;
        Ok(table)
    }

    /// Enforces that original<->renamed is a bijection: every identity name,
    /// original or renamed, must be claimed by exactly one rule. Violations
    /// are load-time errors, never runtime surprises.
    pub fn validate(&self) -> Result<()> {
        let mut kinds = UniqueSet::new("kind");
        let mut types = UniqueSet::new("resource type");
        let mut short_names = UniqueSet::new("short name");

        for group in &self.groups {
            for resource in &group.resources {
                kinds.insert(&resource.kind)?;
                kinds.insert(&resource.list_kind)?;
                kinds.insert(&self.renamed_kind(&resource.kind))?;
                kinds.insert(&self.renamed_kind(&resource.list_kind))?;

                types.insert(&resource.plural)?;
                types.insert(&resource.singular)?;
                types.insert(&self.renamed_type(&resource.plural))?;
                types.insert(&self.renamed_type(&resource.singular))?;

                for short_name in &resource.short_names {
                    short_names.insert(short_name)?;
                    short_names.insert(&self.renamed_short_name(short_name))?;
                }
            }
        }

        let mut paths = UniqueSet::new("webhook path");
        for webhook in &self.webhooks {
            paths
                .insert(&webhook.path)
                .map_err(|_| RulesError::DuplicateWebhookPath(webhook.path.clone()))?;
        }

        Ok(())
    }

    pub fn renamed_kind(&self, kind: &str) -> String {
        format!("{}{kind}", self.prefixes.kind)
    }

    pub fn renamed_type(&self, resource_type: &str) -> String {
        format!("{}{resource_type}", self.prefixes.resource)
    }

    pub fn renamed_short_name(&self, short_name: &str) -> String {
        format!("{}{short_name}", self.prefixes.short_name)
    }

    pub fn group_rule(&self, action: Action, group: &str) -> Option<&GroupRule> {
        self.groups.iter().find(|rule| match action {
            Action::Rename => rule.group == group,
            Action::Restore => rule.renamed == group,
        })
    }

    /// Maps an API group name in the given direction.
    pub fn map_group(&self, action: Action, group: &str) -> Option<&str> {
        self.group_rule(action, group).map(|rule| match action {
            Action::Rename => rule.renamed.as_str(),
            Action::Restore => rule.group.as_str(),
        })
    }

    /// Maps a `group/version` string in the given direction, preserving the
    /// version segment.
    pub fn map_api_version(&self, action: Action, api_version: &str) -> Option<String> {
        let (group, version) = api_version.split_once('/')?;
        let mapped = self.map_group(action, group)?;
        Some(format!("{mapped}/{version}"))
    }

    /// Finds the rule matching a resource type (plural) within a group, both
    /// given in the source form of `action`.
    pub fn resource_by_type(
        &self,
        action: Action,
        group: &str,
        resource_type: &str,
    ) -> Option<(&GroupRule, &ResourceRule)> {
        let group_rule = self.group_rule(action, group)?;
        let resource = group_rule.resources.iter().find(|rule| match action {
            Action::Rename => rule.plural == resource_type,
            Action::Restore => self.renamed_type(&rule.plural) == resource_type,
        })?;
        Some((group_rule, resource))
    }

    /// Finds the rule matching a JSON object by its `apiVersion`/`kind`.
    ///
    /// The group from `api_version` narrows the search when present; a kind
    /// match alone suffices otherwise (kinds are globally unique per
    /// [`RuleTable::validate`]).
    pub fn find_for_object(
        &self,
        action: Action,
        api_version: Option<&str>,
        kind: &str,
    ) -> Option<ObjectRule<'_>> {
        let group_of = |api_version: &str| match api_version.split_once('/') {
            Some((group, _)) => group.to_string(),
            None => String::new(),
        };

        self.groups
            .iter()
            .filter(|group| match (action, api_version) {
                (_, None) => true,
                (Action::Rename, Some(v)) => group.group == group_of(v),
                (Action::Restore, Some(v)) => group.renamed == group_of(v),
            })
            .find_map(|group| {
                group.resources.iter().find_map(|resource| {
                    let (kind_form, list_kind_form) = match action {
                        Action::Rename => (resource.kind.clone(), resource.list_kind.clone()),
                        Action::Restore => (
                            self.renamed_kind(&resource.kind),
                            self.renamed_kind(&resource.list_kind),
                        ),
                    };

                    if kind == kind_form {
                        Some(ObjectRule {
                            group,
                            resource,
                            is_list: false,
                        })
                    } else if kind == list_kind_form {
                        Some(ObjectRule {
                            group,
                            resource,
                            is_list: true,
                        })
                    } else {
                        None
                    }
                })
            })
    }

    /// Maps a label/annotation key in the given direction.
    ///
    /// A key participates iff its domain segment (before `/`) equals a known
    /// group or is a subdomain of one; the name segment is never touched.
    /// Returns [`None`] for keys that match no rule.
    pub fn map_label_key(&self, action: Action, key: &str) -> Option<String> {
        let (domain, name) = key.split_once('/')?;

        for rule in &self.groups {
            let (from, to) = match action {
                Action::Rename => (rule.group.as_str(), rule.renamed.as_str()),
                Action::Restore => (rule.renamed.as_str(), rule.group.as_str()),
            };

            if domain == from {
                return Some(format!("{to}/{name}"));
            }

            if let Some(subdomain) = domain.strip_suffix(from) {
                if let Some(subdomain) = subdomain.strip_suffix('.') {
                    return Some(format!("{subdomain}.{to}/{name}"));
                }
            }
        }

        None
    }

    pub fn webhook_rule(&self, path: &str) -> Option<&WebhookRule> {
        self.webhooks.iter().find(|rule| rule.path == path)
    }
}

/// Collects identity names during validation, rejecting duplicates.
struct UniqueSet {
    what: &'static str,
    seen: std::collections::HashSet<String>,
}

impl UniqueSet {
    fn new(what: &'static str) -> Self {
        Self {
            what,
            seen: Default::default(),
        }
    }

    fn insert(&mut self, name: &str) -> Result<()> {
        if self.seen.insert(name.to_string()) {
            Ok(())
        } else {
            Err(RulesError::RenameCollision {
                what: self.what,
                name: name.to_string(),
            })
        }
    }
}
