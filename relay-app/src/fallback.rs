//! Keyword replies used when no upstream is configured or it keeps failing.
//! Pure and infallible.

pub const EMPTY_PROMPT_REPLY: &str = "Say something and I'll reply 🙂";
pub const GREETING_REPLY: &str = "Hello! How can I help you today?";
pub const HELP_REPLY: &str = "I can answer simple questions or act as a demo AI. Ask about weather, coding tips, or say 'projects' to learn about me.";
pub const PROJECT_REPLY: &str = "You can build a weather app, personal finance tracker, or an AI chatbot like this — great starter projects!";
pub const GITHUB_REPLY: &str =
    "Check out my GitHub profile for projects: https://github.com/sagr12004";
pub const THANKS_REPLY: &str = "You're welcome! Happy to help.";
pub const DEFLECTION_REPLY: &str = "Sorry — I'm a demo. Try 'hello', 'projects', or 'help'.";

// Substring matches, checked in order; the first hit wins.
const KEYWORD_TABLE: &[(&[&str], &str)] = &[
    (&["hello", "hi"], GREETING_REPLY),
    (&["help"], HELP_REPLY),
    (&["project"], PROJECT_REPLY),
    (&["github"], GITHUB_REPLY),
    (&["thank"], THANKS_REPLY),
];

pub fn reply(message: &str) -> &'static str {
    let message = message.trim().to_lowercase();
    if message.is_empty() {
        return EMPTY_PROMPT_REPLY;
    }
    KEYWORD_TABLE
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| message.contains(k)))
        .map(|(_, reply)| *reply)
        .unwrap_or(DEFLECTION_REPLY)
}
