//! Routing slips
//!
//! A routing slip records the kernels a command or event has passed through
//! so that no kernel handles the same message twice, even after it crossed a
//! process boundary and came back.
//!
//! # Command slips
//! Two-phase: a kernel stamps *arrival* before it dispatches a command and
//! *completion* once it is done. Entries keep arrival order.
//!
//! # Event slips
//! Single-phase: every kernel an event bubbles through stamps it once.
//!
//! Both kinds can be continued with a slip that travelled further (the copy
//! that came back from a remote kernel). The continuation must repeat this
//! slip as its prefix; whatever follows is appended, and any entry that is
//! already present is a divergence.

use serde::{Deserialize, Serialize};

use crate::contract::ids::KernelUri;
use crate::error::{MeshError, Result};

const ARRIVED_TAG: &str = "?tag=arrived";

/// One kernel visit on a command slip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlipEntry {
    pub uri: KernelUri,
    pub completed: bool,
}

/// Two-phase routing slip carried by commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRoutingSlip {
    entries: Vec<SlipEntry>,
}

impl CommandRoutingSlip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the command reached `uri`
    pub fn stamp_as_arrived(&mut self, uri: &KernelUri) -> Result<()> {
        if self.contains(uri) {
            return Err(MeshError::AlreadyInRoutingSlip {
                uri: uri.to_string(),
                slip: self.describe(),
            });
        }
        self.entries.push(SlipEntry {
            uri: uri.clone(),
            completed: false,
        });
        Ok(())
    }

    /// Record that `uri` finished handling the command
    pub fn stamp(&mut self, uri: &KernelUri) -> Result<()> {
        let slip = self.describe();
        match self
            .entries
            .iter_mut()
            .find(|entry| &entry.uri == uri && !entry.completed)
        {
            Some(entry) => {
                entry.completed = true;
                Ok(())
            }
            None => Err(MeshError::NotArrivedOrCompleted {
                uri: uri.to_string(),
                slip,
            }),
        }
    }

    /// Completed kernels in arrival order
    pub fn to_uri_array(&self) -> Vec<KernelUri> {
        self.entries
            .iter()
            .filter(|entry| entry.completed)
            .map(|entry| entry.uri.clone())
            .collect()
    }

    pub fn contains(&self, uri: &KernelUri) -> bool {
        self.entries.iter().any(|entry| &entry.uri == uri)
    }

    pub fn has_arrived_at(&self, uri: &KernelUri) -> bool {
        self.entries
            .iter()
            .any(|entry| &entry.uri == uri && !entry.completed)
    }

    /// True if `uris` is a non-empty prefix of this slip's kernels
    pub fn starts_with(&self, uris: &[KernelUri]) -> bool {
        let own: Vec<&KernelUri> = self.entries.iter().map(|e| &e.uri).collect();
        is_prefix(&own, uris)
    }

    pub fn entries(&self) -> &[SlipEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Continue this slip with one that travelled further
    pub fn append(&mut self, other: &CommandRoutingSlip) -> Result<()> {
        let own: Vec<&KernelUri> = self.entries.iter().map(|e| &e.uri).collect();
        let theirs: Vec<&KernelUri> = other.entries.iter().map(|e| &e.uri).collect();
        let skip = shared_prefix_len(&own, &theirs);

        let remainder = &other.entries[skip..];
        if let Some(duplicate) = remainder.iter().find(|entry| self.contains(&entry.uri)) {
            return Err(MeshError::RoutingSlipDiverged {
                uri: duplicate.uri.to_string(),
                slip: self.describe(),
                other: other.describe(),
            });
        }
        // kernels on the shared prefix may have completed further along
        for (entry, theirs) in self.entries.iter_mut().zip(&other.entries[..skip]) {
            entry.completed |= theirs.completed;
        }
        self.entries.extend(remainder.iter().cloned());
        Ok(())
    }

    /// Wire form: completed entries as plain uris, pending ones tagged
    pub fn to_wire(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| {
                if entry.completed {
                    entry.uri.to_string()
                } else {
                    format!("{}{}", entry.uri, ARRIVED_TAG)
                }
            })
            .collect()
    }

    pub fn from_wire(values: &[String]) -> Result<Self> {
        let mut entries = Vec::with_capacity(values.len());
        for value in values {
            let (raw, completed) = match value.strip_suffix(ARRIVED_TAG) {
                Some(raw) => (raw, false),
                None => (value.as_str(), true),
            };
            let uri = KernelUri::parse(raw)?;
            if entries.iter().any(|e: &SlipEntry| e.uri == uri) {
                return Err(MeshError::AlreadyInRoutingSlip {
                    uri: uri.to_string(),
                    slip: values.join(","),
                });
            }
            entries.push(SlipEntry { uri, completed });
        }
        Ok(Self { entries })
    }

    fn describe(&self) -> String {
        self.to_wire().join(",")
    }
}

impl std::fmt::Display for CommandRoutingSlip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.describe())
    }
}

/// Single-phase routing slip carried by events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventRoutingSlip {
    uris: Vec<KernelUri>,
}

impl EventRoutingSlip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, uri: &KernelUri) -> Result<()> {
        if self.contains(uri) {
            return Err(MeshError::AlreadyInRoutingSlip {
                uri: uri.to_string(),
                slip: self.describe(),
            });
        }
        self.uris.push(uri.clone());
        Ok(())
    }

    /// Stamp unless `uri` is already on the slip; true if stamped
    pub fn stamp_if_absent(&mut self, uri: &KernelUri) -> bool {
        if self.contains(uri) {
            return false;
        }
        self.uris.push(uri.clone());
        true
    }

    /// Continue this slip with one that travelled further
    pub fn continue_with(&mut self, other: &EventRoutingSlip) -> Result<()> {
        let own: Vec<&KernelUri> = self.uris.iter().collect();
        let theirs: Vec<&KernelUri> = other.uris.iter().collect();
        let skip = shared_prefix_len(&own, &theirs);

        let remainder = &other.uris[skip..];
        if let Some(duplicate) = remainder.iter().find(|uri| self.contains(uri)) {
            return Err(MeshError::RoutingSlipDiverged {
                uri: duplicate.to_string(),
                slip: self.describe(),
                other: other.describe(),
            });
        }
        self.uris.extend(remainder.iter().cloned());
        Ok(())
    }

    /// True if `uris` is a non-empty prefix of this slip
    pub fn starts_with(&self, uris: &[KernelUri]) -> bool {
        let own: Vec<&KernelUri> = self.uris.iter().collect();
        is_prefix(&own, uris)
    }

    pub fn contains(&self, uri: &KernelUri) -> bool {
        self.uris.contains(uri)
    }

    pub fn to_uri_array(&self) -> Vec<KernelUri> {
        self.uris.clone()
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn to_wire(&self) -> Vec<String> {
        self.uris.iter().map(|uri| uri.to_string()).collect()
    }

    pub fn from_wire(values: &[String]) -> Result<Self> {
        let mut slip = Self::new();
        for value in values {
            slip.stamp(&KernelUri::parse(value)?)?;
        }
        Ok(slip)
    }

    fn describe(&self) -> String {
        self.to_wire().join(",")
    }
}

impl std::fmt::Display for EventRoutingSlip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.describe())
    }
}

/// Length of `own` if it is a prefix of `theirs`, else 0
fn shared_prefix_len(own: &[&KernelUri], theirs: &[&KernelUri]) -> usize {
    if own.len() <= theirs.len() && own.iter().zip(theirs).all(|(a, b)| a == b) {
        own.len()
    } else {
        0
    }
}

fn is_prefix(own: &[&KernelUri], candidate: &[KernelUri]) -> bool {
    !candidate.is_empty()
        && candidate.len() <= own.len()
        && candidate.iter().zip(own).all(|(a, b)| a == *b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(raw: &str) -> KernelUri {
        KernelUri::parse(raw).unwrap()
    }

    fn completed(uris: &[&str]) -> CommandRoutingSlip {
        let mut slip = CommandRoutingSlip::new();
        for raw in uris {
            slip.stamp_as_arrived(&uri(raw)).unwrap();
            slip.stamp(&uri(raw)).unwrap();
        }
        slip
    }

    #[test]
    fn test_double_arrival_fails() {
        let mut slip = CommandRoutingSlip::new();
        slip.stamp_as_arrived(&uri("kernel://a")).unwrap();
        let err = slip.stamp_as_arrived(&uri("kernel://a")).unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(err
            .to_string()
            .starts_with("The uri kernel://a/ is already in the routing slip"));
    }

    #[test]
    fn test_completion_requires_arrival() {
        let mut slip = CommandRoutingSlip::new();
        let err = slip.stamp(&uri("kernel://a")).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("The uri kernel://a/ is not in the routing slip or has already been completed"));
    }

    #[test]
    fn test_completion_cannot_repeat() {
        let mut slip = completed(&["kernel://a"]);
        assert!(slip.stamp(&uri("kernel://a")).is_err());
        assert!(slip.stamp_as_arrived(&uri("kernel://a")).is_err());
    }

    #[test]
    fn test_uri_array_lists_completed_in_arrival_order() {
        let mut slip = CommandRoutingSlip::new();
        slip.stamp_as_arrived(&uri("kernel://a")).unwrap();
        slip.stamp_as_arrived(&uri("kernel://b")).unwrap();
        slip.stamp_as_arrived(&uri("kernel://c")).unwrap();
        slip.stamp(&uri("kernel://b")).unwrap();
        slip.stamp(&uri("kernel://a")).unwrap();

        assert_eq!(
            slip.to_uri_array(),
            vec![uri("kernel://a"), uri("kernel://b")]
        );
        assert!(slip.has_arrived_at(&uri("kernel://c")));
    }

    #[test]
    fn test_append_divergent_prefix_fails() {
        let mut slip = completed(&["kernel://1", "kernel://2"]);
        let other = completed(&["kernel://1", "kernel://3", "kernel://4"]);
        let err = slip.append(&other).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The uri kernel://1/ is already in the routing slip [kernel://1/,kernel://2/], cannot continue with routing slip [kernel://1/,kernel://3/,kernel://4/]"
        );
        assert_eq!(slip.len(), 2);
    }

    #[test]
    fn test_append_shared_prefix_succeeds() {
        let mut slip = completed(&["kernel://1", "kernel://2"]);
        let other = completed(&["kernel://1", "kernel://2", "kernel://3", "kernel://4"]);
        slip.append(&other).unwrap();
        assert_eq!(
            slip.to_uri_array(),
            vec![
                uri("kernel://1"),
                uri("kernel://2"),
                uri("kernel://3"),
                uri("kernel://4")
            ]
        );
    }

    #[test]
    fn test_append_disjoint_slip_succeeds() {
        let mut slip = completed(&["kernel://a", "kernel://b"]);
        slip.append(&completed(&["kernel://c", "kernel://d"])).unwrap();
        assert_eq!(slip.to_uri_array().len(), 4);
    }

    #[test]
    fn test_append_keeps_pending_entries_pending() {
        let mut local = CommandRoutingSlip::new();
        local.stamp_as_arrived(&uri("kernel://local/")).unwrap();

        let mut remote = local.clone();
        remote.stamp_as_arrived(&uri("kernel://remote/")).unwrap();
        remote.stamp(&uri("kernel://remote/")).unwrap();

        local.append(&remote).unwrap();
        local.stamp(&uri("kernel://local/")).unwrap();
        assert_eq!(
            local.to_uri_array(),
            vec![uri("kernel://local/"), uri("kernel://remote/")]
        );
    }

    #[test]
    fn test_append_picks_up_later_completions() {
        let mut local = CommandRoutingSlip::new();
        local.stamp_as_arrived(&uri("kernel://proxy")).unwrap();
        let mut remote = local.clone();
        remote.stamp_as_arrived(&uri("kernel://remote")).unwrap();
        local.append(&remote).unwrap();
        assert!(local.has_arrived_at(&uri("kernel://remote")));

        remote.stamp(&uri("kernel://remote")).unwrap();
        local.append(&remote).unwrap();
        assert_eq!(local.len(), 2);
        assert_eq!(local.to_uri_array(), vec![uri("kernel://remote")]);
    }

    #[test]
    fn test_command_slip_wire_form() {
        let mut slip = completed(&["kernel://a"]);
        slip.stamp_as_arrived(&uri("kernel://b")).unwrap();
        let wire = slip.to_wire();
        assert_eq!(wire, vec!["kernel://a/", "kernel://b/?tag=arrived"]);
        assert_eq!(CommandRoutingSlip::from_wire(&wire).unwrap(), slip);
    }

    #[test]
    fn test_event_slip_double_stamp_fails() {
        let mut slip = EventRoutingSlip::new();
        slip.stamp(&uri("kernel://a")).unwrap();
        assert!(slip.stamp(&uri("kernel://a")).is_err());
    }

    #[test]
    fn test_event_slip_starts_with() {
        let mut slip = EventRoutingSlip::new();
        slip.stamp(&uri("kernel://a")).unwrap();
        slip.stamp(&uri("kernel://b")).unwrap();

        assert!(slip.starts_with(&[uri("kernel://a")]));
        assert!(slip.starts_with(&[uri("kernel://a"), uri("kernel://b")]));
        assert!(!slip.starts_with(&[uri("kernel://b")]));
        assert!(!slip.starts_with(&[]));
        assert!(!slip.starts_with(&[
            uri("kernel://a"),
            uri("kernel://b"),
            uri("kernel://c")
        ]));
    }

    #[test]
    fn test_event_slip_continue_with() {
        let mut slip = EventRoutingSlip::new();
        slip.stamp(&uri("kernel://a")).unwrap();

        let mut further = slip.clone();
        further.stamp(&uri("kernel://b")).unwrap();
        slip.continue_with(&further).unwrap();
        assert_eq!(slip.to_uri_array(), vec![uri("kernel://a"), uri("kernel://b")]);

        let mut divergent = EventRoutingSlip::new();
        divergent.stamp(&uri("kernel://c")).unwrap();
        divergent.stamp(&uri("kernel://b")).unwrap();
        let err = slip.continue_with(&divergent).unwrap_err();
        assert!(err.to_string().starts_with("The uri kernel://b/ is already"));
    }
}
