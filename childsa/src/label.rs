//! Security labels restricting a CHILD_SA to labelled traffic

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// How a configured label is applied to negotiated CHILD_SAs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelMode {
    /// The configured label is used as-is for every CHILD_SA
    #[default]
    Simple,
    /// The configured label is a generic SELinux context; concrete labels
    /// arrive with kernel acquires, one CHILD_SA per label
    Selinux,
}

/// An opaque security label as exchanged in TS payloads and attached to
/// kernel policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabel(Vec<u8>);

impl SecurityLabel {
    /// Wrap raw label bytes
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self(value.into())
    }

    /// The raw label bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Failure while agreeing on a security label
#[derive(Debug, Error, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LabelError {
    #[error("The label hints of TSi and TSr differ")]
    SidesDiffer,
    #[error("The negotiated label does not match the one this SA is bound to")]
    BoundMismatch,
}

/// Agree on the label for the CHILD_SA from the hints carried in the two
/// TS payloads; both sides must name the same label. With no hints, the
/// fallback applies (usually the configured label).
pub fn select_label(
    tsi_hint: Option<&[u8]>,
    tsr_hint: Option<&[u8]>,
    fallback: Option<&SecurityLabel>,
) -> Result<Option<SecurityLabel>, LabelError> {
    match (tsi_hint, tsr_hint) {
        (Some(a), Some(b)) => {
            if a != b {
                return Err(LabelError::SidesDiffer);
            }
            Ok(Some(SecurityLabel::new(a)))
        }
        (None, None) => Ok(fallback.cloned()),
        _ => Err(LabelError::SidesDiffer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_hints_win_over_fallback() {
        let fallback = SecurityLabel::new(b"generic".as_slice());
        let selected = select_label(Some(b"specific"), Some(b"specific"), Some(&fallback))
            .unwrap()
            .unwrap();
        assert_eq!(selected.as_bytes(), b"specific");
    }

    #[test]
    fn differing_hints_fail() {
        assert_eq!(
            select_label(Some(b"a"), Some(b"b"), None),
            Err(LabelError::SidesDiffer)
        );
        assert_eq!(
            select_label(Some(b"a"), None, None),
            Err(LabelError::SidesDiffer)
        );
    }

    #[test]
    fn fallback_applies_without_hints() {
        assert_eq!(select_label(None, None, None).unwrap(), None);
        let fallback = SecurityLabel::new(b"generic".as_slice());
        assert_eq!(
            select_label(None, None, Some(&fallback)).unwrap(),
            Some(fallback)
        );
    }
}
