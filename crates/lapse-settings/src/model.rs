use std::collections::BTreeMap;

use tracing::debug;

use crate::error::ValidationError;
use crate::normalize::{normalize, StepPolicy};
use crate::tree::{flatten, ConfigNode, SettingEntry};
use crate::value::{RawValue, SettingValue};

/// Source and sink of the camera configuration tree.
///
/// `write_config` receives the whole tree; implementations commit the leaves
/// reported by [`ConfigNode::changed_leaves`].
pub trait ConfigStore {
    type Error: From<ValidationError>;

    fn read_config(&mut self) -> Result<ConfigNode, Self::Error>;
    fn write_config(&mut self, root: &ConfigNode) -> Result<(), Self::Error>;
}

/// Every leaf of `root` keyed by dotted path. Containers are skipped.
pub fn query(root: &ConfigNode) -> BTreeMap<String, SettingEntry> {
    flatten(root)
        .into_iter()
        .filter_map(|(path, node)| {
            SettingEntry::from_node(path.clone(), node).map(|entry| (path, entry))
        })
        .collect()
}

/// Normalizes every entry against `root`, then writes them all into the tree.
///
/// Nothing is written unless every entry is accepted.
pub fn stage(
    root: &mut ConfigNode,
    entries: &BTreeMap<String, RawValue>,
    policy: StepPolicy,
) -> Result<Vec<(String, SettingValue)>, ValidationError> {
    let staged = {
        let leaves = query(root);
        let mut staged = Vec::with_capacity(entries.len());
        for (path, raw) in entries {
            let entry = leaves
                .get(path)
                .ok_or_else(|| ValidationError::UnknownSetting(path.clone()))?;
            if entry.readonly {
                return Err(ValidationError::ReadOnly(path.clone()));
            }
            staged.push((path.clone(), normalize(entry, raw, policy)?));
        }
        staged
    };

    for (path, value) in &staged {
        match root.find_mut(path) {
            Some(node) => node.set_value(value.clone()),
            None => return Err(ValidationError::UnknownSetting(path.clone())),
        }
        debug!(setting = %path, value = %value, "staged");
    }
    Ok(staged)
}

/// Reads the tree from `store`, stages `entries` and commits once.
pub fn apply<S: ConfigStore>(
    store: &mut S,
    entries: &BTreeMap<String, RawValue>,
    policy: StepPolicy,
) -> Result<Vec<(String, SettingValue)>, S::Error> {
    let mut root = store.read_config()?;
    let staged = stage(&mut root, entries, policy)?;
    if staged.is_empty() {
        return Ok(staged);
    }
    store.write_config(&root)?;
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SettingKind;

    #[derive(Debug, PartialEq)]
    enum StoreError {
        Validation(ValidationError),
        Busy,
    }

    impl From<ValidationError> for StoreError {
        fn from(e: ValidationError) -> Self {
            Self::Validation(e)
        }
    }

    struct MemStore {
        root: ConfigNode,
        commits: usize,
        fail_commit: bool,
    }

    impl MemStore {
        fn new() -> Self {
            Self { root: camera_tree(), commits: 0, fail_commit: false }
        }
    }

    impl ConfigStore for MemStore {
        type Error = StoreError;

        fn read_config(&mut self) -> Result<ConfigNode, StoreError> {
            Ok(self.root.clone())
        }

        fn write_config(&mut self, root: &ConfigNode) -> Result<(), StoreError> {
            if self.fail_commit {
                return Err(StoreError::Busy);
            }
            for (path, value) in root.changed_leaves() {
                if let Some(node) = self.root.find_mut(&path) {
                    node.value = Some(value.clone());
                }
            }
            self.commits += 1;
            Ok(())
        }
    }

    fn camera_tree() -> ConfigNode {
        ConfigNode::container(
            "main",
            vec![
                ConfigNode::container(
                    "imgsettings",
                    vec![
                        ConfigNode::leaf("iso", SettingKind::Choice)
                            .with_label("ISO Speed")
                            .with_choices(["Auto", "100", "200", "400", "800"])
                            .with_value(SettingValue::Choice("100".into())),
                        ConfigNode::leaf("whitebalance", SettingKind::Choice)
                            .with_choices(["Auto", "Daylight", "Cloudy"])
                            .with_value(SettingValue::Choice("Auto".into())),
                    ],
                ),
                ConfigNode::container(
                    "capturesettings",
                    vec![
                        ConfigNode::leaf("exposurecompensation", SettingKind::Range)
                            .with_bounds(-3.0, 3.0, 0.5)
                            .with_value(SettingValue::Number(0.0)),
                        ConfigNode::leaf("continuousaf", SettingKind::Toggle)
                            .with_value(SettingValue::Toggle(true)),
                    ],
                ),
                ConfigNode::container(
                    "status",
                    vec![ConfigNode::leaf("serialnumber", SettingKind::Text)
                        .read_only()
                        .with_value(SettingValue::Text("0123".into()))],
                ),
                ConfigNode::container(
                    "settings",
                    vec![ConfigNode::leaf("datetime", SettingKind::Date)
                        .with_value(SettingValue::Date(0))],
                ),
            ],
        )
    }

    fn entries(pairs: &[(&str, RawValue)]) -> BTreeMap<String, RawValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn query_lists_only_leaves() {
        let q = query(&camera_tree());
        assert_eq!(q.len(), 6);
        assert!(!q.contains_key("main.imgsettings"));
        let iso = &q["main.imgsettings.iso"];
        assert_eq!(iso.label, "ISO Speed");
        assert_eq!(iso.kind, SettingKind::Choice);
        assert_eq!(iso.current, Some(SettingValue::Choice("100".into())));
        assert!(q["main.status.serialnumber"].readonly);
    }

    #[test]
    fn apply_commits_once_and_reads_back() {
        let mut store = MemStore::new();
        let staged = apply(
            &mut store,
            &entries(&[
                ("main.imgsettings.iso", RawValue::Int(400)),
                ("main.capturesettings.exposurecompensation", RawValue::Float(-1.5)),
                ("main.capturesettings.continuousaf", "off".into()),
            ]),
            StepPolicy::Strict,
        )
        .unwrap();
        assert_eq!(staged.len(), 3);
        assert_eq!(store.commits, 1);

        let back = query(&store.read_config().unwrap());
        assert_eq!(back["main.imgsettings.iso"].current, Some(SettingValue::Choice("400".into())));
        assert_eq!(
            back["main.capturesettings.exposurecompensation"].current,
            Some(SettingValue::Number(-1.5))
        );
        assert_eq!(
            back["main.capturesettings.continuousaf"].current,
            Some(SettingValue::Toggle(false))
        );
    }

    #[test]
    fn one_bad_key_leaves_device_untouched() {
        let mut store = MemStore::new();
        let before = query(&store.read_config().unwrap());
        let err = apply(
            &mut store,
            &entries(&[
                ("main.imgsettings.iso", RawValue::Int(200)),
                ("main.imgsettings.whitebalance", "Daylight".into()),
                ("main.capturesettings.exposurecompensation", RawValue::Float(1.0)),
                ("main.capturesettings.continuousaf", RawValue::Bool(false)),
                ("main.imgsettings.shutterspeed", "1/250".into()),
            ]),
            StepPolicy::Strict,
        )
        .unwrap_err();
        assert_eq!(
            err,
            StoreError::Validation(ValidationError::UnknownSetting(
                "main.imgsettings.shutterspeed".into()
            ))
        );
        assert_eq!(store.commits, 0);
        assert_eq!(query(&store.read_config().unwrap()), before);
    }

    #[test]
    fn invalid_value_is_rejected_before_any_write() {
        let mut root = camera_tree();
        let err = stage(
            &mut root,
            &entries(&[
                ("main.imgsettings.iso", RawValue::Int(400)),
                ("main.capturesettings.exposurecompensation", RawValue::Float(0.3)),
            ]),
            StepPolicy::Strict,
        )
        .unwrap_err();
        assert_eq!(err.path(), "main.capturesettings.exposurecompensation");
        assert!(root.changed_leaves().is_empty());
    }

    #[test]
    fn snap_policy_rounds_range_values() {
        let mut root = camera_tree();
        let staged = stage(
            &mut root,
            &entries(&[("main.capturesettings.exposurecompensation", RawValue::Float(0.3))]),
            StepPolicy::Snap,
        )
        .unwrap();
        assert_eq!(staged[0].1, SettingValue::Number(0.5));
    }

    #[test]
    fn read_only_and_container_paths_are_refused() {
        let mut root = camera_tree();
        let err = stage(
            &mut root,
            &entries(&[("main.status.serialnumber", "x".into())]),
            StepPolicy::Strict,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::ReadOnly("main.status.serialnumber".into()));

        let err = stage(&mut root, &entries(&[("main.status", "x".into())]), StepPolicy::Strict)
            .unwrap_err();
        assert_eq!(err, ValidationError::UnknownSetting("main.status".into()));
    }

    #[test]
    fn failed_commit_is_reported() {
        let mut store = MemStore::new();
        store.fail_commit = true;
        let err = apply(
            &mut store,
            &entries(&[("main.settings.datetime", "2024-01-01".into())]),
            StepPolicy::Strict,
        )
        .unwrap_err();
        assert_eq!(err, StoreError::Busy);
        assert_eq!(store.commits, 0);
    }

    #[test]
    fn empty_batch_does_not_commit() {
        let mut store = MemStore::new();
        let staged = apply(&mut store, &BTreeMap::new(), StepPolicy::Strict).unwrap();
        assert!(staged.is_empty());
        assert_eq!(store.commits, 0);
    }
}
