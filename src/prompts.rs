use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::clock;
use crate::docs::schema::{Config, StructuredDocument};
use crate::tools::reference::ReferenceItem;

pub const SYSTEM_PROMPT: &str = r#"You are a personal coach who helps one user with nutrition, body weight and training. You keep their food and weight log, know their targets and remember what they have asked you to remember. Everything you know about the user lives in documents you can read and update with tools; never invent values you could look up.

When the user tells you what they ate, log it. Read the known-ingredients document before estimating nutrition, fall back to the reference database for foods that contribute meaningfully to the entry, and use general knowledge for the rest. Ask for clarification only when you are genuinely unsure. After logging, briefly say what you recorded and the numbers, so mistakes are easy to spot.

Keep casual replies short and warm. Write explanations in prose rather than lists unless the user asks for a list. Do not open with praise of the question. If the user corrects you, check the claim before agreeing.

Use the code execution tool for arithmetic that matters, such as summing a day's intake or projecting weight trends.

<environment>
Current date: {{current_date}}
Time zone: {{current_time_zone}} (UTC offset {{current_time_zone_offset}} minutes)
Weekday: {{current_weekday}}
</environment>

<user_info>
{{user_info}}
</user_info>

<user_memories>
{{user_memories}}
</user_memories>"#;

const NO_USER_INFO: &str = "No user information is available.";
const NO_USER_MEMORIES: &str = "No user memories are available.";

/// Render the system prompt from the raw config document. A config that
/// does not parse leaves the profile sections at their defaults.
///
/// Only date-level fields go in here so the cached prefix survives a whole
/// day; the time of day travels in the per-message reminder.
pub fn system_prompt(config_raw: &str, now: DateTime<Utc>, tz: Tz) -> String {
    let config = Config::parse(config_raw).ok();

    let user_info = config
        .as_ref()
        .and_then(|c| c.user_info.as_deref())
        .filter(|info| !info.trim().is_empty())
        .unwrap_or(NO_USER_INFO)
        .to_string();

    let user_memories = match config.as_ref().map(|c| &c.memory_entries) {
        Some(entries) if !entries.is_empty() => entries
            .iter()
            .map(|entry| format!("- {}", entry))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => NO_USER_MEMORIES.to_string(),
    };

    SYSTEM_PROMPT
        .replace("{{current_date}}", &clock::format_date(now, tz))
        .replace("{{current_time_zone}}", tz.name())
        .replace(
            "{{current_time_zone_offset}}",
            &clock::offset_minutes(now, tz).to_string(),
        )
        .replace("{{current_weekday}}", &clock::weekday(now, tz))
        .replace("{{user_info}}", &user_info)
        .replace("{{user_memories}}", &user_memories)
}

/// Prefix block added to every user message.
pub fn system_reminder(now: DateTime<Utc>, tz: Tz) -> String {
    format!(
        "<system_reminder>\nCurrent time: {}\n</system_reminder>\n\n",
        clock::format_time(now, tz)
    )
}

pub const REFERENCE_MATCH_PROMPT: &str = r#"You are a food database search engine. Find the best matching food items for: "{{query}}"

Match on the query's core intent:
- For a plain ingredient (e.g. "banaani"), list the raw or plain form first, then minimally processed variants.
- For a specific product (e.g. "Fazer kanelipulla"), match that product or very close equivalents.
- For a prepared dish (e.g. "banaanileipä"), include items where the queried food is the main characteristic.
- Leave out items where the queried food is only a minor component or a flavour, unless nothing better exists.

Return the matches in Finnish, in exactly this format:
<match_1>
Name: [name] ([class], [process])
Kcal: [per 100 g or 100 ml]
Protein: [per 100 g or 100 ml]g
Units: [unit descriptions with masses]
</match_1>
<match_2>
...
</match_2>

Return at most 25 matches, ordered by relevance. If nothing reasonable matches, return exactly: "Ei osumia"
Do not add explanations, analysis or calculations.

Database:
{{database}}"#;

fn format_number(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.1}", v))
}

/// Plain-text rendering of one dataset batch.
pub fn format_reference_batch(batch: &[ReferenceItem]) -> String {
    batch
        .iter()
        .map(|item| {
            let units = item
                .units
                .iter()
                .map(|u| format!("{} ({:.1} g)", u.description, u.mass))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "Name: {} ({}, {})\nKcal: {}\nProtein: {}\nUnits: {}\n",
                item.name,
                item.class.as_deref().unwrap_or("null"),
                item.process.as_deref().unwrap_or("null"),
                format_number(item.nutrients.kcal),
                format_number(item.nutrients.protein),
                units
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

pub fn reference_match_prompt(query: &str, batch: &[ReferenceItem]) -> String {
    REFERENCE_MATCH_PROMPT
        .replace("{{database}}", &format_reference_batch(batch))
        .replace("{{query}}", query)
}

pub const TRANSCRIBE_PROMPT: &str = r#"Transcribe the attached audio into text. The speaker most likely uses Finnish or English.

Respond with a single raw JSON object with a "transcript" key and nothing else: no markdown, no extra text.

Produce a clean transcript: drop filler words ("um", "uh", "niinku") and verbal tics, ignore pauses, and add basic punctuation so the result reads as a coherent phrase. The text fills an input field in a food logging app, so transcribe brand names, product names and foods with particular care. The user's saved foods below show how those names are spelled:

<saved_food_items>
{{saved_food_items}}
</saved_food_items>"#;

pub fn transcribe_prompt(saved_food_items: &str) -> String {
    TRANSCRIBE_PROMPT.replace("{{saved_food_items}}", saved_food_items)
}
