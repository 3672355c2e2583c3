//! UI metadata endpoints.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Voice catalog for the TTS picker. The index values are the provider
/// contract; labels and grouping are presentation only.
const VOICES: &[(&str, &str, &str)] = &[
    ("zh_female_intellectual", "Thoughtful anchor", "Chinese female"),
    ("zh_female_morning", "Morning host", "Chinese female"),
    ("zh_female_gossip", "Playful", "Chinese female"),
    ("zh_male_tech", "Tech creator", "Chinese male"),
    ("zh_male_sports", "Sports commentary", "Chinese male"),
    ("zh_male_breaking_news", "Breaking news", "Chinese male"),
    ("en_female_intellectual", "Professional", "English female"),
    ("en_female_morning", "Morning anchor", "English female"),
    ("en_female_smoky", "Smoky", "English female"),
    ("en_male_tech", "Tech geek", "English male"),
    ("en_male_breaking_news", "Breaking news", "English male"),
    ("en_male_talk_show", "Talk show", "English male"),
    ("voice_01", "Voice 01", "Generic"),
    ("voice_02", "Voice 02", "Generic"),
    ("voice_03", "Voice 03", "Generic"),
    ("voice_04", "Voice 04", "Generic"),
];

/// GET /api/meta/tts — provider, base URL, and the voice list for the
/// front-end dropdown.
pub async fn tts_schema(State(state): State<AppState>) -> Json<Value> {
    let tts = &state.config.tts;
    let voices: Vec<Value> = VOICES
        .iter()
        .enumerate()
        .map(|(i, (index, label, group))| {
            let mut voice = json!({
                "index": index,
                "label": label,
                "group": group,
            });
            if i == 0 {
                voice["default"] = json!(true);
            }
            voice
        })
        .collect();

    Json(json!({
        "provider": tts.provider,
        "base_url": tts.base_url,
        "voices": voices,
    }))
}
