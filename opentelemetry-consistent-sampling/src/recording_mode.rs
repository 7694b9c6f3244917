use std::{fmt, str::FromStr};

use crate::SamplingError;

/// Controls which ancestor information a dropped span publishes to its children.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RecordingMode {
    /// No ancestor tracking. Descendants of dropped spans lose their link to the trace.
    ParentLink,
    /// Dropped spans publish the id of their nearest sampled ancestor.
    AncestorLink,
    /// Dropped spans publish the nearest sampled ancestor and the number of
    /// dropped spans in between.
    #[default]
    AncestorLinkAndDistance,
}

impl RecordingMode {
    /// Whether the id of the nearest sampled ancestor is recorded.
    pub fn collect_ancestor_link(self) -> bool {
        !matches!(self, RecordingMode::ParentLink)
    }

    /// Whether the number of dropped ancestors is recorded.
    pub fn collect_ancestor_distance(self) -> bool {
        matches!(self, RecordingMode::AncestorLinkAndDistance)
    }

    /// The name used for this mode in the `sampling-mode` attribute.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingMode::ParentLink => "PARENT_LINK",
            RecordingMode::AncestorLink => "ANCESTOR_LINK",
            RecordingMode::AncestorLinkAndDistance => "ANCESTOR_LINK_AND_DISTANCE",
        }
    }
}

impl fmt::Display for RecordingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingMode {
    type Err = SamplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PARENT_LINK" | "parent_link" => Ok(RecordingMode::ParentLink),
            "ANCESTOR_LINK" | "ancestor_link" => Ok(RecordingMode::AncestorLink),
            "ANCESTOR_LINK_AND_DISTANCE" | "ancestor_link_and_distance" => {
                Ok(RecordingMode::AncestorLinkAndDistance)
            }
            other => Err(SamplingError::InvalidConfiguration(format!(
                "unknown recording mode '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RecordingMode::ParentLink, false, false)]
    #[case(RecordingMode::AncestorLink, true, false)]
    #[case(RecordingMode::AncestorLinkAndDistance, true, true)]
    fn collected_fields(#[case] mode: RecordingMode, #[case] link: bool, #[case] distance: bool) {
        assert_eq!(mode.collect_ancestor_link(), link);
        assert_eq!(mode.collect_ancestor_distance(), distance);
    }

    #[rstest]
    #[case(RecordingMode::ParentLink)]
    #[case(RecordingMode::AncestorLink)]
    #[case(RecordingMode::AncestorLinkAndDistance)]
    fn wire_name_parses_back(#[case] mode: RecordingMode) {
        assert_eq!(mode.to_string().parse::<RecordingMode>(), Ok(mode));
        assert_eq!(
            mode.as_str().to_lowercase().parse::<RecordingMode>(),
            Ok(mode)
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(matches!(
            "sometimes".parse::<RecordingMode>(),
            Err(SamplingError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn default_tracks_everything() {
        assert_eq!(
            RecordingMode::default(),
            RecordingMode::AncestorLinkAndDistance
        );
    }
}
