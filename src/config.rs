use crate::constants::{
    CPU_FREQUENCY_DEFAULT, PROGRAM_START_DEFAULT, REFRESH_FREQUENCY_DEFAULT,
    TIMER_FREQUENCY_DEFAULT,
};

/// Behavior toggles covering every documented divergence between the original
/// CHIP-8 interpreter and the S-CHIP extension.
///
/// Each flag defaults to `false`, which selects the legacy behavior. The set
/// is fixed at construction; changing quirks means building a new
/// [`crate::Machine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Leave RAM contents in place across `reset`. S-CHIP never initialized
    /// memory; the legacy interpreter zeroes it.
    pub preserve_ram: bool,

    /// 8xy6/8xyE shift Vx in place. Legacy first copies Vy into Vx and
    /// shifts that.
    pub shift_vx_in_place: bool,

    /// Fx55/Fx65 leave the index register untouched. Legacy advances I by
    /// x + 1 after the copy.
    pub index_unchanged: bool,

    /// Bnnn jumps to Vx + nnn, where x is the high nibble of nnn. Legacy
    /// jumps to V0 + nnn.
    pub jump_with_vx: bool,

    /// Dxy0 in lo-res draws a 16-byte 8x16 sprite instead of the 32-byte
    /// 16x16 form.
    pub lores_tall_sprite: bool,

    /// 00FE/00FF keep the framebuffer intact when switching resolution
    /// instead of clearing it.
    pub keep_display_on_mode_switch: bool,

    /// Sprites drawn past the screen edge are clipped. Legacy wraps the
    /// sprite origin around the display instead.
    pub clip_sprites: bool,

    /// Hi-res Dxyn sets VF to the number of sprite rows that collided
    /// rather than to 1.
    pub count_collisions: bool,

    /// Hi-res Dxyn also counts rows falling below the bottom edge of the
    /// screen as collisions, even though they are never rendered.
    pub count_clipped_rows: bool,
}

/// Construction-time machine configuration.
///
/// Frequencies are in Hz; zero means unthrottled, never an error: the paced
/// action then runs on every scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub cpu_frequency: u32,
    pub timer_frequency: u32,
    pub refresh_frequency: u32,
    /// Address programs are loaded at and the reset target for PC.
    pub program_start: u16,
    pub quirks: Quirks,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cpu_frequency: CPU_FREQUENCY_DEFAULT,
            timer_frequency: TIMER_FREQUENCY_DEFAULT,
            refresh_frequency: REFRESH_FREQUENCY_DEFAULT,
            program_start: PROGRAM_START_DEFAULT,
            quirks: Quirks::default(),
        }
    }
}

impl Config {
    /// Configuration with every quirk enabled, matching S-CHIP 1.1 behavior.
    pub fn schip() -> Self {
        Config {
            quirks: Quirks {
                preserve_ram: true,
                shift_vx_in_place: true,
                index_unchanged: true,
                jump_with_vx: true,
                lores_tall_sprite: true,
                keep_display_on_mode_switch: true,
                clip_sprites: true,
                count_collisions: true,
                count_clipped_rows: true,
            },
            ..Config::default()
        }
    }
}
