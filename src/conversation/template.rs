//! Prompt templates
//!
//! A template turns a [`Conversation`] into the exact prompt string a model
//! family was trained on. The control tokens and spacing are part of the
//! output format, so the built-ins are plain string emitters with fixed tests.
//!
//! # Supported Formats
//!
//! - **llama-2**: `<s>[INST] <<SYS>>\nsystem\n<</SYS>>\n\nuser [/INST] assistant </s><s>[INST] user [/INST]`
//! - **vicuna_v1.1**: `<preamble> USER: user ASSISTANT: assistant</s>USER: user ASSISTANT:`
//! - **custom**: a Jinja template supplied by the operator, rendered with minijinja
//!
//! # Custom template context
//!
//! | Variable | Contents |
//! |---|---|
//! | `system_prompt` | the system prompt (may be empty) |
//! | `messages` | every message, each with `role` and `text` |
//! | `messages_without_system` | `messages` minus the leading system message |

use std::path::Path;
use std::sync::Arc;

use minijinja::{context, Environment, UndefinedBehavior};

use super::{Conversation, Role};

const TEMPLATE_NAME: &str = "prompt";

/// Errors from building or rendering a prompt template
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to parse prompt template: {0}")]
    Parse(#[source] minijinja::Error),

    #[error("failed to execute prompt template: {0}")]
    Render(#[source] minijinja::Error),

    #[error("failed to read prompt template file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown prompt template type: '{0}'")]
    UnknownType(String),
}

/// Renders a conversation into a model-specific prompt.
///
/// Implementations hold no per-request state and are shared across requests.
pub trait PromptTemplate: Send + Sync + std::fmt::Debug {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Whether the output is meaningless without a system message
    fn requires_system_prompt(&self) -> bool {
        false
    }

    fn render(&self, conversation: &Conversation) -> Result<String, TemplateError>;
}

/// Look up a built-in template by its configuration name
pub fn builtin(name: &str) -> Result<Arc<dyn PromptTemplate>, TemplateError> {
    match name {
        Llama2Template::NAME => Ok(Arc::new(Llama2Template)),
        VicunaV11Template::NAME => Ok(Arc::new(VicunaV11Template)),
        _ => Err(TemplateError::UnknownType(name.to_string())),
    }
}

/// Llama 2 chat format
#[derive(Debug, Clone, Copy, Default)]
pub struct Llama2Template;

impl Llama2Template {
    pub const NAME: &'static str = "llama-2";
}

impl PromptTemplate for Llama2Template {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn requires_system_prompt(&self) -> bool {
        true
    }

    fn render(&self, conversation: &Conversation) -> Result<String, TemplateError> {
        let mut prompt = String::from("<s>");
        for (i, message) in conversation.messages().iter().enumerate() {
            match message.role {
                Role::System => {
                    prompt.push_str("[INST] <<SYS>>\n");
                    prompt.push_str(&message.text);
                    prompt.push_str("\n<</SYS>>\n\n");
                }
                // closes the [INST] block opened by the system message
                _ if i == 1 => {
                    prompt.push_str(&message.text);
                    prompt.push_str(" [/INST]");
                }
                Role::Assistant => {
                    prompt.push(' ');
                    prompt.push_str(&message.text);
                    prompt.push_str(" </s><s>");
                }
                Role::User => {
                    prompt.push_str("[INST] ");
                    prompt.push_str(&message.text);
                    prompt.push_str(" [/INST]");
                }
            }
        }
        Ok(prompt)
    }
}

/// Vicuna v1.1 transcript format
#[derive(Debug, Clone, Copy, Default)]
pub struct VicunaV11Template;

impl VicunaV11Template {
    pub const NAME: &'static str = "vicuna_v1.1";

    pub const PREAMBLE: &'static str = "A chat between a curious user and an artificial intelligence assistant. \
        The assistant gives helpful, detailed, and polite answers to the user's questions. ";
}

impl PromptTemplate for VicunaV11Template {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn render(&self, conversation: &Conversation) -> Result<String, TemplateError> {
        let mut prompt = String::from(Self::PREAMBLE);
        for (i, message) in conversation.messages_without_system().iter().enumerate() {
            match message.role {
                Role::User => {
                    if i > 1 {
                        prompt.push_str("</s>");
                    }
                    prompt.push_str("USER: ");
                    prompt.push_str(&message.text);
                }
                Role::Assistant => {
                    prompt.push_str(" ASSISTANT: ");
                    prompt.push_str(&message.text);
                }
                Role::System => {}
            }
        }
        prompt.push_str(" ASSISTANT:");
        Ok(prompt)
    }
}

/// Operator-supplied Jinja template, parsed once at startup
#[derive(Debug)]
pub struct CustomTemplate {
    env: Environment<'static>,
}

impl CustomTemplate {
    pub fn new(source: impl Into<String>) -> Result<Self, TemplateError> {
        let mut env = Environment::new();
        // undefined variables are render errors
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .map_err(TemplateError::Parse)?;
        Ok(Self { env })
    }

    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::new(source)
    }
}

impl PromptTemplate for CustomTemplate {
    fn name(&self) -> &str {
        "custom"
    }

    fn render(&self, conversation: &Conversation) -> Result<String, TemplateError> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(TemplateError::Render)?;
        template
            .render(context! {
                system_prompt => conversation.system_prompt(),
                messages => conversation.messages(),
                messages_without_system => conversation.messages_without_system(),
            })
            .map_err(TemplateError::Render)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_turns() -> Conversation {
        Conversation::from_history("SP", &["U1", "A1", "U2"])
    }

    #[test]
    fn test_llama2_single_turn() {
        let conversation = Conversation::from_history("SP", &["U1"]);
        let prompt = Llama2Template.render(&conversation).unwrap();
        assert_eq!(prompt, "<s>[INST] <<SYS>>\nSP\n<</SYS>>\n\nU1 [/INST]");
    }

    #[test]
    fn test_llama2_multi_turn() {
        let prompt = Llama2Template.render(&three_turns()).unwrap();
        assert_eq!(
            prompt,
            "<s>[INST] <<SYS>>\nSP\n<</SYS>>\n\nU1 [/INST] A1 </s><s>[INST] U2 [/INST]"
        );
    }

    #[test]
    fn test_llama2_requires_system_prompt() {
        assert!(Llama2Template.requires_system_prompt());
        assert!(!VicunaV11Template.requires_system_prompt());
    }

    #[test]
    fn test_vicuna_multi_turn() {
        let prompt = VicunaV11Template.render(&three_turns()).unwrap();
        assert_eq!(
            prompt,
            format!(
                "{}USER: U1 ASSISTANT: A1</s>USER: U2 ASSISTANT:",
                VicunaV11Template::PREAMBLE
            )
        );
    }

    #[test]
    fn test_vicuna_ignores_system_message() {
        let with_system = VicunaV11Template
            .render(&Conversation::from_history("ignored", &["hi"]))
            .unwrap();
        let without_system = VicunaV11Template
            .render(&Conversation::from_history("", &["hi"]))
            .unwrap();
        assert_eq!(with_system, without_system);
        assert!(with_system.ends_with("USER: hi ASSISTANT:"));
    }

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(builtin("llama-2").unwrap().name(), "llama-2");
        assert_eq!(builtin("vicuna_v1.1").unwrap().name(), "vicuna_v1.1");
        assert!(matches!(
            builtin("alpaca"),
            Err(TemplateError::UnknownType(name)) if name == "alpaca"
        ));
    }

    #[test]
    fn test_custom_template() {
        let template = CustomTemplate::new(
            "[{{ system_prompt }}]{% for m in messages_without_system %}<{{ m.role }}>{{ m.text }}{% endfor %}<assistant>",
        )
        .unwrap();
        let prompt = template.render(&three_turns()).unwrap();
        assert_eq!(prompt, "[SP]<user>U1<assistant>A1<user>U2<assistant>");
        assert!(!template.requires_system_prompt());
    }

    #[test]
    fn test_custom_template_does_not_escape() {
        let template = CustomTemplate::new("{{ messages[0].text }}").unwrap();
        let prompt = template
            .render(&Conversation::from_history("", &["<b>&</b>"]))
            .unwrap();
        assert_eq!(prompt, "<b>&</b>");
    }

    #[test]
    fn test_custom_template_keeps_trailing_newline() {
        let template = CustomTemplate::new("{{ system_prompt }}\n").unwrap();
        let prompt = template.render(&Conversation::new("SP")).unwrap();
        assert_eq!(prompt, "SP\n");
    }

    #[test]
    fn test_custom_template_parse_error() {
        let result = CustomTemplate::new("{% for m in messages %}");
        assert!(matches!(result, Err(TemplateError::Parse(_))));
    }

    #[test]
    fn test_custom_template_unknown_variable() {
        let template = CustomTemplate::new("{{ nope }}").unwrap();
        let result = template.render(&three_turns());
        assert!(matches!(result, Err(TemplateError::Render(_))));
    }

    #[test]
    fn test_custom_template_missing_file() {
        let result = CustomTemplate::from_file(Path::new("/nonexistent/prompt.j2"));
        assert!(matches!(result, Err(TemplateError::Io { .. })));
    }

    #[test]
    fn test_render_through_conversation() {
        let template = builtin("vicuna_v1.1").unwrap();
        let prompt = three_turns().render(template.as_ref()).unwrap();
        assert!(prompt.starts_with(VicunaV11Template::PREAMBLE));
    }
}
