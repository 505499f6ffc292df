pub const USER_ROLE: &str = "<|User|>";
pub const ASSISTANT_ROLE: &str = "<|Assistant|>";
pub const IMAGE_START_TAG: &str = "<begin_of_image>";
pub const PAD_TAG: &str = "<｜▁pad▁｜>";

/// Single-turn conversation with an empty assistant reply, primed to emit image tokens.
pub fn image_generation_prompt(user_prompt: &str) -> String {
    format!("{USER_ROLE}: {user_prompt}\n\n{ASSISTANT_ROLE}:{IMAGE_START_TAG}")
}
