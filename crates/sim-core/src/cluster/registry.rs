use super::{ClusterKind, ClusterOptions, ClusterProfile};
use crate::error::{Result, SimError};

pub type Constructor = fn(&ClusterOptions) -> Result<ClusterProfile>;

/// Name to constructor table for the built-in cluster profiles.
///
/// Lookups are case-insensitive and accept the older `clusters.BIOClass`
/// style spellings found in saved snapshots.
pub struct ClusterRegistry {
    entries: Vec<(&'static str, ClusterKind, Constructor)>,
}

impl ClusterRegistry {
    pub fn builtin() -> Self {
        let entries: Vec<(&'static str, ClusterKind, Constructor)> = vec![
            ("template", ClusterKind::Template, |o| {
                ClusterProfile::new(ClusterKind::Template, o)
            }),
            ("hipatia", ClusterKind::Hipatia, |o| {
                ClusterProfile::new(ClusterKind::Hipatia, o)
            }),
            ("marcc", ClusterKind::Marcc, |o| {
                ClusterProfile::new(ClusterKind::Marcc, o)
            }),
            ("bio", ClusterKind::Bio, |o| ClusterProfile::new(ClusterKind::Bio, o)),
            ("stampede", ClusterKind::Stampede, |o| {
                ClusterProfile::new(ClusterKind::Stampede, o)
            }),
            ("frontera", ClusterKind::Frontera, |o| {
                ClusterProfile::new(ClusterKind::Frontera, o)
            }),
            ("hypatia", ClusterKind::Hypatia, |o| {
                ClusterProfile::new(ClusterKind::Hypatia, o)
            }),
        ];
        Self { entries }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(n, _, _)| *n).collect()
    }

    pub fn lookup(&self, name: &str) -> Result<ClusterKind> {
        let key = normalize(name);
        self.entries
            .iter()
            .find(|(n, _, _)| *n == key)
            .map(|(_, kind, _)| *kind)
            .ok_or_else(|| SimError::UnknownCluster(name.to_string()))
    }

    pub fn build(&self, name: &str, opts: &ClusterOptions) -> Result<ClusterProfile> {
        let key = normalize(name);
        let ctor = self
            .entries
            .iter()
            .find(|(n, _, _)| *n == key)
            .map(|(_, _, ctor)| *ctor)
            .ok_or_else(|| SimError::UnknownCluster(name.to_string()))?;
        ctor(opts)
    }
}

fn normalize(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let lower = lower.strip_prefix("clusters.").unwrap_or(&lower);
    let lower = lower.strip_suffix("class").unwrap_or(lower);
    match lower {
        "cluster" | "" => "template".to_string(),
        other => other.to_string(),
    }
}
