//! Shared UI icons.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

pub static WAVE: Emoji<'_, '_> = Emoji("🌊 ", "[W]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[V]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static LOOP: Emoji<'_, '_> = Emoji("🚧 ", "[LOOP]");
pub static STEP_BACK: Emoji<'_, '_> = Emoji("⏪ ", "[BACK]");
pub static COST: Emoji<'_, '_> = Emoji("💰 ", "$");
