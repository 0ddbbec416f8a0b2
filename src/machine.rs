use std::io;
use std::io::Read;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{Config, Quirks};
use crate::constants::{
    BIG_FONT_START, BIG_SPRITE_SHEET, FONT_START, NUM_REGISTERS, RAM_SIZE, SPRITE_SHEET,
    STACK_START,
};
use crate::display::{Display, FrameBuffer};
use crate::error::{Fault, LoadError};
use crate::instruction::Instruction;
use crate::keypad::Keypad;
use crate::operations;

/// Fixed RND seed; every construction starts the sequence over so runs are
/// reproducible.
const RNG_SEED: u64 = 0x5EED;

const ONE_SEC: u64 = 1000;

/// # Machine
///
/// The virtual machine aggregate: memory, registers, timers, display,
/// keypad, quirk flags, and the pacing state that throttles execution
/// against wall-clock time.
///
/// The outer loop drives it by:
/// - feeding key events via `key_press`/`key_release`
/// - calling `cycle` once per pass with the current millisecond clock
/// - sampling `display_updated`/`beep`/`exit` and the framebuffer afterwards
///
/// A `Fault` from `cycle` leaves the machine intact and available; `reset`
/// recovers it.
pub struct Machine {
    pub(crate) memory: [u8; RAM_SIZE],
    pub(crate) v: [u8; NUM_REGISTERS],
    pub(crate) pc: u16,
    /// Points at the most recent return-address slot in the memory-backed
    /// stack region; rests at `STACK_START` when no call is active.
    pub(crate) sp: u16,
    pub(crate) i: u16,
    pub(crate) delay_timer: u8,
    pub(crate) sound_timer: u8,
    pub(crate) display: Display,
    pub(crate) keypad: Keypad,
    pub(crate) quirks: Quirks,
    pub(crate) rng: StdRng,

    program_start: u16,
    /// Retained program image so a soft reset can reload it.
    program: Vec<u8>,

    cpu_frequency: u32,
    timer_frequency: u32,
    refresh_frequency: u32,
    cpu_interval: u64,
    timer_interval: u64,
    refresh_interval: u64,

    cpu_cum: u64,
    delay_cum: u64,
    sound_cum: u64,
    refresh_cum: u64,
    last_cycle: Option<u64>,
    cycle_time: u64,

    display_updated: bool,
    pub(crate) beep: bool,
    pub(crate) exit: bool,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        let mut machine = Machine {
            memory: [0; RAM_SIZE],
            v: [0; NUM_REGISTERS],
            pc: 0,
            sp: 0,
            i: 0,
            delay_timer: 0,
            sound_timer: 0,
            display: Display::new(),
            keypad: Keypad::new(),
            quirks: config.quirks,
            rng: StdRng::seed_from_u64(RNG_SEED),
            program_start: config.program_start,
            program: Vec::new(),
            cpu_frequency: 0,
            timer_frequency: 0,
            refresh_frequency: 0,
            cpu_interval: 0,
            timer_interval: 0,
            refresh_interval: 0,
            cpu_cum: 0,
            delay_cum: 0,
            sound_cum: 0,
            refresh_cum: 0,
            last_cycle: None,
            cycle_time: 0,
            display_updated: false,
            beep: false,
            exit: false,
        };
        machine.set_cpu_frequency(config.cpu_frequency);
        machine.set_timer_frequency(config.timer_frequency);
        machine.set_refresh_frequency(config.refresh_frequency);
        machine.reset();
        machine.load_font();
        machine
    }

    /// Reinitializes registers, timers, pacing, display, and keypad while
    /// keeping the configuration. RAM is zeroed unless `preserve_ram`; the
    /// font is not reloaded (see `soft_reset`).
    pub fn reset(&mut self) {
        self.pc = self.program_start;
        self.sp = STACK_START;
        self.i = 0;
        self.delay_timer = 0;
        self.sound_timer = 0;

        self.cpu_cum = 0;
        self.delay_cum = 0;
        self.sound_cum = 0;
        self.refresh_cum = 0;
        self.last_cycle = None;
        self.cycle_time = 0;

        self.display_updated = false;
        self.beep = false;
        self.exit = false;
        self.display.hires = false;

        if !self.quirks.preserve_ram {
            self.memory = [0; RAM_SIZE];
        }
        self.v = [0; NUM_REGISTERS];
        self.keypad.reset();
        self.display.clear();
    }

    /// `reset` plus reloading the font and the retained program image.
    pub fn soft_reset(&mut self) {
        self.reset();
        self.load_font();
        let start = self.program_start as usize;
        self.memory[start..start + self.program.len()].copy_from_slice(&self.program);
    }

    pub fn set_cpu_frequency(&mut self, frequency: u32) {
        self.cpu_frequency = frequency;
        if frequency > 0 {
            self.cpu_interval = ONE_SEC / u64::from(frequency);
        }
    }

    pub fn set_timer_frequency(&mut self, frequency: u32) {
        self.timer_frequency = frequency;
        if frequency > 0 {
            self.timer_interval = ONE_SEC / u64::from(frequency);
        }
    }

    pub fn set_refresh_frequency(&mut self, frequency: u32) {
        self.refresh_frequency = frequency;
        if frequency > 0 {
            self.refresh_interval = ONE_SEC / u64::from(frequency);
        }
    }

    /// Writes both font sheets into their reserved region at the bottom of
    /// memory.
    pub fn load_font(&mut self) {
        let font = FONT_START as usize;
        let big_font = BIG_FONT_START as usize;
        self.memory[font..font + SPRITE_SHEET.len()].copy_from_slice(&SPRITE_SHEET);
        self.memory[big_font..big_font + BIG_SPRITE_SHEET.len()]
            .copy_from_slice(&BIG_SPRITE_SHEET);
    }

    /// Loads a program image at the configured start address and retains a
    /// copy for `soft_reset`.
    pub fn load_rom(&mut self, reader: &mut dyn io::Read) -> Result<usize, LoadError> {
        let mut image = Vec::new();
        reader.read_to_end(&mut image)?;

        let start = self.program_start as usize;
        let capacity = RAM_SIZE - start;
        if image.len() > capacity {
            return Err(LoadError::TooLarge {
                size: image.len(),
                capacity,
            });
        }

        self.memory[start..start + image.len()].copy_from_slice(&image);
        log::info!(
            "loaded {} byte program at {:#05X}",
            image.len(),
            self.program_start
        );
        self.program = image;
        Ok(self.program.len())
    }

    /// Writes a single instruction at the program start address. Handy for
    /// diagnostics and tests.
    pub fn load_instruction(&mut self, instruction: u16) {
        let start = self.program_start as usize;
        self.memory[start] = (instruction >> 8) as u8;
        self.memory[start + 1] = (instruction & 0x00FF) as u8;
    }

    /// One scheduler step against the supplied millisecond clock reading.
    ///
    /// Accumulates the elapsed time since the previous step, executes at most
    /// one instruction once the CPU accumulator reaches the configured
    /// interval (every step when unthrottled), then advances the delay,
    /// sound, and refresh timers. Returns whether an instruction executed.
    pub fn cycle(&mut self, now: u64) -> Result<bool, Fault> {
        self.update_elapsed_time(now);

        let mut executed = false;
        self.cpu_cum += self.cycle_time;
        if self.cpu_frequency == 0 || self.cpu_cum >= self.cpu_interval {
            self.cpu_cum = 0;
            self.execute()?;
            executed = true;
        }

        self.handle_timers();
        Ok(executed)
    }

    /// Fetches, decodes, and executes exactly one instruction.
    ///
    /// PC advances past the fetched word before execution so jumps and calls
    /// simply overwrite it. Any key in the transitional released state is
    /// settled afterwards.
    pub fn execute(&mut self) -> Result<(), Fault> {
        let op = self.fetch()?;
        self.pc = self.pc.wrapping_add(2);
        operations::execute(self, Instruction::decode(op))?;
        self.keypad.settle_released();
        Ok(())
    }

    fn fetch(&self) -> Result<u16, Fault> {
        let pc = self.pc as usize;
        if pc + 1 >= RAM_SIZE {
            return Err(Fault::MemoryOutOfBounds { address: self.pc });
        }
        let left = u16::from(self.memory[pc]);
        let right = u16::from(self.memory[pc + 1]);
        Ok(left << 8 | right)
    }

    /// Decrements the delay and sound timers and pulses the refresh flag at
    /// their configured frequencies. A zero frequency fires every step.
    fn handle_timers(&mut self) {
        if self.delay_timer > 0 {
            self.delay_cum += self.cycle_time;
            if self.timer_frequency == 0 || self.delay_cum >= self.timer_interval {
                self.delay_timer -= 1;
                self.delay_cum = 0;
            }
        }

        if self.sound_timer > 0 {
            self.beep = true;
            self.sound_cum += self.cycle_time;
            if self.timer_frequency == 0 || self.sound_cum >= self.timer_interval {
                self.sound_timer -= 1;
                self.sound_cum = 0;
            }
        } else {
            self.beep = false;
        }

        self.display_updated = false;
        self.refresh_cum += self.cycle_time;
        if self.refresh_frequency == 0 || self.refresh_cum >= self.refresh_interval {
            self.display_updated = true;
            self.refresh_cum = 0;
        }
    }

    fn update_elapsed_time(&mut self, now: u64) {
        let previous = self.last_cycle.replace(now).unwrap_or(now);
        self.cycle_time = now.saturating_sub(previous);
    }

    /// Verifies that `len` bytes starting at `start` stay inside memory.
    pub(crate) fn check_span(&self, start: u16, len: usize) -> Result<(), Fault> {
        if (start as usize) + len > RAM_SIZE {
            return Err(Fault::MemoryOutOfBounds { address: start });
        }
        Ok(())
    }

    /// Set the pressed status of a key.
    pub fn key_press(&mut self, key: u8) {
        self.keypad.press(key);
    }

    /// Lift a key; it passes through the released state for one instruction.
    pub fn key_release(&mut self, key: u8) {
        self.keypad.release(key);
    }

    /// The packed framebuffer (64 rows of 16 bytes, MSB-first).
    pub fn frame(&self) -> &FrameBuffer {
        self.display.rows()
    }

    /// Returns the framebuffer on the step a refresh is due.
    pub fn get_frame(&self) -> Option<&FrameBuffer> {
        if self.display_updated {
            Some(self.display.rows())
        } else {
            None
        }
    }

    /// True for the single step on which a display refresh is due.
    pub fn display_updated(&self) -> bool {
        self.display_updated
    }

    /// True while the sound timer is running; the audio collaborator should
    /// emit a tone as long as this holds.
    pub fn beep(&self) -> bool {
        self.beep
    }

    /// True once the program asked the outer loop to terminate.
    pub fn exit(&self) -> bool {
        self.exit
    }

    /// True while the display is in hi-res (128x64) mode.
    pub fn hires(&self) -> bool {
        self.display.hires
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::PROGRAM_START_DEFAULT;

    fn machine() -> Machine {
        Machine::new(Config::default())
    }

    #[test]
    fn test_new_machine_has_font_loaded() {
        let machine = machine();
        assert_eq!(machine.memory[0x000..0x005], [0xF0, 0x90, 0x90, 0x90, 0xF0]);
        assert_eq!(machine.memory[0x050..0x052], [0xFF, 0xFF]);
    }

    #[test]
    fn test_machine_fetches_op() {
        let mut machine = machine();
        machine.memory[0x200..0x202].copy_from_slice(&[0xAA, 0xBB]);
        assert_eq!(machine.fetch().unwrap(), 0xAABB);
    }

    #[test]
    fn test_fetch_past_end_of_memory_faults() {
        let mut machine = machine();
        machine.pc = 0x0FFF;
        assert_eq!(
            machine.execute(),
            Err(Fault::MemoryOutOfBounds { address: 0x0FFF })
        );
    }

    #[test]
    fn test_load_rom_writes_and_retains_image() {
        let mut machine = machine();
        let rom: &[u8] = &[0x00, 0xE0, 0x12, 0x00];
        assert_eq!(machine.load_rom(&mut &rom[..]).unwrap(), 4);
        assert_eq!(&machine.memory[0x200..0x204], rom);
        assert_eq!(machine.program, rom);
    }

    #[test]
    fn test_load_rom_rejects_oversized_image() {
        let mut machine = machine();
        let rom = vec![0u8; RAM_SIZE];
        assert!(matches!(
            machine.load_rom(&mut &rom[..]),
            Err(LoadError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_reset_clears_ram_by_default() {
        let mut machine = machine();
        machine.memory[0x300] = 0xAB;
        machine.reset();
        assert_eq!(machine.memory[0x300], 0x00);
    }

    #[test]
    fn test_reset_preserves_ram_with_quirk() {
        let mut config = Config::default();
        config.quirks.preserve_ram = true;
        let mut machine = Machine::new(config);
        machine.memory[0x300] = 0xAB;
        machine.reset();
        assert_eq!(machine.memory[0x300], 0xAB);
    }

    #[test]
    fn test_soft_reset_restores_font_and_program() {
        let mut machine = machine();
        let rom: &[u8] = &[0x12, 0x34];
        machine.load_rom(&mut &rom[..]).unwrap();
        machine.memory[0x000] = 0x00;
        machine.memory[0x200] = 0x00;
        machine.soft_reset();
        assert_eq!(machine.memory[0x000], 0xF0);
        assert_eq!(&machine.memory[0x200..0x202], rom);
    }

    #[test]
    fn test_unthrottled_cpu_executes_every_cycle() {
        let mut machine = machine();
        machine.load_instruction(0x1200); // jump-to-self
        for now in 0..5 {
            assert!(machine.cycle(now).unwrap());
        }
    }

    #[test]
    fn test_throttled_cpu_waits_for_interval() {
        let mut machine = Machine::new(Config {
            cpu_frequency: 60,
            ..Config::default()
        });
        machine.load_instruction(0x1200);

        // Interval is 1000 / 60 = 16ms. The first cycle establishes the
        // clock origin and accumulates nothing.
        assert!(!machine.cycle(0).unwrap());
        assert!(!machine.cycle(8).unwrap());
        assert!(machine.cycle(16).unwrap());
        // The accumulator restarts after each execution.
        assert!(!machine.cycle(24).unwrap());
        assert!(machine.cycle(32).unwrap());
    }

    #[test]
    fn test_exactly_one_instruction_per_interval_step() {
        let mut machine = Machine::new(Config {
            cpu_frequency: 60,
            ..Config::default()
        });
        machine.load_instruction(0x1200);
        machine.cycle(0).unwrap();
        for step in 1..=10 {
            assert!(machine.cycle(step * 16).unwrap());
        }
    }

    #[test]
    fn test_delay_timer_decrements_at_timer_frequency() {
        let mut machine = machine();
        machine.load_instruction(0x1200);
        machine.delay_timer = 3;
        machine.cycle(0).unwrap();
        machine.cycle(8).unwrap(); // under the 1000 / 60 = 16ms interval
        assert_eq!(machine.delay_timer, 3);
        machine.cycle(24).unwrap();
        assert_eq!(machine.delay_timer, 2);
    }

    #[test]
    fn test_beep_tracks_sound_timer() {
        let mut machine = Machine::new(Config {
            timer_frequency: 0, // decrement every step
            ..Config::default()
        });
        machine.load_instruction(0x1200);
        machine.sound_timer = 2;
        machine.cycle(0).unwrap();
        assert!(machine.beep());
        machine.cycle(1).unwrap();
        assert!(machine.beep());
        assert_eq!(machine.sound_timer, 0);
        machine.cycle(2).unwrap();
        assert!(!machine.beep());
    }

    #[test]
    fn test_display_updated_pulses_at_refresh_frequency() {
        let mut machine = machine();
        machine.load_instruction(0x1200);
        machine.cycle(0).unwrap();
        assert!(!machine.display_updated());
        assert!(machine.get_frame().is_none());
        machine.cycle(34).unwrap(); // past 1000 / 30
        assert!(machine.display_updated());
        assert!(machine.get_frame().is_some());
        machine.cycle(35).unwrap();
        assert!(!machine.display_updated());
    }

    #[test]
    fn test_clear_and_jump_program_runs_clean() {
        // 00E0 (clear) followed by a jump back to it.
        let mut machine = machine();
        let rom: &[u8] = &[0x00, 0xE0, 0x12, 0x00];
        machine.load_rom(&mut &rom[..]).unwrap();

        for now in 0..100 {
            machine.cycle(now).unwrap();
        }

        assert!(machine.frame().iter().flatten().all(|&byte| byte == 0));
        assert_eq!(machine.pc, PROGRAM_START_DEFAULT);
        assert!(!machine.exit());
    }

    #[test]
    fn test_fault_leaves_machine_recoverable() {
        let mut machine = machine();
        machine.load_instruction(0xF155); // store V0..=V1 at I
        machine.i = 0x0FFF;
        assert!(machine.cycle(0).is_err());
        machine.reset();
        machine.load_font();
        machine.load_instruction(0x1200);
        assert!(machine.cycle(0).is_ok());
    }

    #[test]
    fn test_random_sequence_is_reproducible() {
        let mut first = machine();
        let mut second = machine();
        for m in [&mut first, &mut second].iter_mut() {
            m.load_instruction(0xC0FF); // V0 = rand & 0xFF
            m.execute().unwrap();
        }
        assert_eq!(first.v[0x0], second.v[0x0]);
    }
}
