use log::warn;

use crate::core::model::{Id, SegmentDraft, Speaker};
use crate::services::analysis::RawSegment;

/// Reconciles raw role-assignment output against the known roster, producing
/// the ordered speaker-tagged drafts that become the chapter's segment set.
///
/// An entry missing both text and speaker is dropped. A speaker is matched
/// against the roster by case-insensitive exact name; the literal "narrator"
/// (any case) and anything unmatched resolve to the Narrator sentinel — no
/// partial or fuzzy matching. If nothing valid remains, the whole chapter text
/// becomes one Narrator segment, so a chapter never ends up with zero segments.
pub fn assign_speakers(
    raw: Vec<RawSegment>,
    roster: &[(Id, String)],
    chapter_text: &str,
) -> Vec<SegmentDraft> {
    let mut drafts = Vec::with_capacity(raw.len());

    for entry in raw {
        if entry.text.is_none() && entry.speaker.is_none() {
            warn!("dropping role-assignment entry with neither text nor speaker");
            continue;
        }

        let speaker = match entry.speaker.as_deref().map(str::trim) {
            None | Some("") => Speaker::Narrator,
            Some(name) if name.eq_ignore_ascii_case("narrator") => Speaker::Narrator,
            Some(name) => match roster
                .iter()
                .find(|(_, roster_name)| roster_name.eq_ignore_ascii_case(name))
            {
                Some((id, _)) => Speaker::Character(*id),
                None => {
                    warn!("speaker {name:?} not in roster, assigning to narrator");
                    Speaker::Narrator
                }
            },
        };

        drafts.push(SegmentDraft {
            text: entry.text.unwrap_or_default(),
            speaker,
        });
    }

    if drafts.is_empty() {
        drafts.push(SegmentDraft {
            text: chapter_text.to_string(),
            speaker: Speaker::Narrator,
        });
    }

    drafts
}
