//! Image tag generation.

use chrono::{DateTime, Utc};

use crate::types::{Artifact, ImageTags};

/// `YYYYmmdd-HHMMSS` tag for a build started at `now`.
pub fn date_time_tag(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

/// Tag every artifact with the same date-time tag.
pub fn date_time_tags<'a>(
    artifacts: impl IntoIterator<Item = &'a Artifact>,
    now: DateTime<Utc>,
) -> ImageTags {
    let tag = date_time_tag(now);
    artifacts
        .into_iter()
        .map(|a| (a.image.clone(), tag.clone()))
        .collect()
}
