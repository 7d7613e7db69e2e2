// ABOUTME: Adaptive card sent to request an activation code, plus activation code formatting
// ABOUTME: Card inputs are `workspace` (new name) and `existing-workspace` (choice of known workspaces)

use boardbot_core::Workspace;
use serde_json::{json, Value};

/// Input id for a new workspace name
pub const WORKSPACE_INPUT: &str = "workspace";

/// Input id for the chosen existing workspace
pub const EXISTING_WORKSPACE_INPUT: &str = "existing-workspace";

/// Fallback text shown by clients that cannot render cards
pub const CARD_FALLBACK_TEXT: &str = "Here's your card";

const ADAPTIVE_CARD_SCHEMA: &str = "http://adaptivecards.io/schemas/adaptive-card.json";

/// Card asking for a new workspace name or one of the org's existing workspaces
pub fn code_card(workspaces: &[Workspace]) -> Value {
    let mut body = vec![
        json!({
            "type": "TextBlock",
            "text": "Get an activation code:",
            "weight": "Bolder",
        }),
        json!({
            "type": "Input.Text",
            "id": WORKSPACE_INPUT,
            "placeholder": "Enter Workspace Name",
        }),
    ];

    if !workspaces.is_empty() {
        let mut sorted: Vec<&Workspace> = workspaces.iter().collect();
        sorted.sort_by(|a, b| a.display_name.to_lowercase().cmp(&b.display_name.to_lowercase()));
        let choices: Vec<Value> = sorted
            .into_iter()
            .map(|w| json!({ "title": w.display_name, "value": w.id }))
            .collect();
        body.push(json!({
            "type": "TextBlock",
            "text": "Or pick an existing workspace:",
            "isSubtle": true,
        }));
        body.push(json!({
            "type": "Input.ChoiceSet",
            "id": EXISTING_WORKSPACE_INPUT,
            "style": "compact",
            "placeholder": "Existing workspaces",
            "choices": choices,
        }));
    }

    json!({
        "$schema": ADAPTIVE_CARD_SCHEMA,
        "type": "AdaptiveCard",
        "version": "1.2",
        "body": body,
        "actions": [{ "type": "Action.Submit", "title": "Provision" }],
    })
}

/// Group an activation code as `XXXX-XXXX-XXXX-rest`
pub fn split_code(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut groups: Vec<String> = chars
        .chunks(4)
        .take(3)
        .map(|group| group.iter().collect())
        .collect();
    if chars.len() > 12 {
        groups.push(chars[12..].iter().collect());
    }
    groups.join("-")
}
