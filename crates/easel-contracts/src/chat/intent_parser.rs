use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

/// Maps one chat line to an intent: `/commands` dispatch to their action,
/// anything else is a generation prompt. Prompt validation (length) is the
/// orchestrator's job, not the parser's.
pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("engine".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("generate", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/start").action, "start");
        assert_eq!(parse_intent("/engines").action, "list_engines");
        assert_eq!(parse_intent("/regen").action, "regenerate");
        assert_eq!(parse_intent("/reset").action, "reset");
        assert_eq!(parse_intent("/help").action, "help");
    }

    #[test]
    fn parse_engine_selection() {
        let intent = parse_intent("/engine huggingface");
        assert_eq!(intent.action, "set_engine");
        assert_eq!(intent.command_args["engine"], json!("huggingface"));

        let bare = parse_intent("  /engine  ");
        assert_eq!(bare.action, "set_engine");
        assert_eq!(bare.command_args["engine"], json!(""));
    }

    #[test]
    fn parse_command_is_case_insensitive() {
        assert_eq!(parse_intent("/START").action, "start");
        let intent = parse_intent("/Engine HF");
        assert_eq!(intent.action, "set_engine");
        assert_eq!(intent.command_args["engine"], json!("HF"));
    }

    #[test]
    fn bare_text_is_a_generation_prompt() {
        let intent = parse_intent("  a red fox in snow  ");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.prompt.as_deref(), Some("a red fox in snow"));
    }

    #[test]
    fn short_text_still_parses_as_generate() {
        let intent = parse_intent("fox");
        assert_eq!(intent.action, "generate");
        assert_eq!(intent.prompt.as_deref(), Some("fox"));
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn empty_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
        assert_eq!(parse_intent("").action, "noop");
    }
}
