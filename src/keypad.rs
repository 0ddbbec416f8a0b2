use crate::constants::NUM_KEYS;

/// The three states a key can occupy.
///
/// `Released` is a transitional state inserted when a down key is lifted. It
/// exists for exactly one executed instruction so the key-wait instruction
/// can observe it, then collapses back to `Up`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Up,
    Down,
    Released,
}

/// The 16-key hex pad.
///
/// Driven by press/release events from whatever maps physical input to key
/// numbers; read by the skip and key-wait instructions. Key numbers are taken
/// modulo 16 since they frequently come out of a general-purpose register.
#[derive(Debug, Clone, Copy)]
pub struct Keypad {
    keys: [KeyState; NUM_KEYS],
}

impl Keypad {
    pub fn new() -> Self {
        Keypad {
            keys: [KeyState::Up; NUM_KEYS],
        }
    }

    /// Returns every key to `Up`.
    pub fn reset(&mut self) {
        self.keys = [KeyState::Up; NUM_KEYS];
    }

    pub fn state(&self, key: u8) -> KeyState {
        self.keys[key as usize % NUM_KEYS]
    }

    /// Marks a key as held down.
    pub fn press(&mut self, key: u8) {
        self.keys[key as usize % NUM_KEYS] = KeyState::Down;
    }

    /// Lifts a key. A key that was down passes through `Released` for one
    /// instruction; releasing an idle key leaves it `Up`.
    pub fn release(&mut self, key: u8) {
        let cell = &mut self.keys[key as usize % NUM_KEYS];
        *cell = match *cell {
            KeyState::Down => KeyState::Released,
            _ => KeyState::Up,
        };
    }

    /// Returns the lowest-numbered key currently in the `Released` state.
    pub fn first_released(&self) -> Option<u8> {
        self.keys
            .iter()
            .position(|&key| key == KeyState::Released)
            .map(|key| key as u8)
    }

    /// Collapses every `Released` key back to `Up`. Runs at the end of each
    /// executed instruction.
    pub fn settle_released(&mut self) {
        for key in self.keys.iter_mut() {
            if *key == KeyState::Released {
                *key = KeyState::Up;
            }
        }
    }
}

impl Default for Keypad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_all_up() {
        let keypad = Keypad::new();
        for key in 0x0..0xF {
            assert_eq!(keypad.state(key), KeyState::Up);
        }
    }

    #[test]
    fn test_press_marks_down() {
        let mut keypad = Keypad::new();
        keypad.press(0xA);
        assert_eq!(keypad.state(0xA), KeyState::Down);
    }

    #[test]
    fn test_release_of_down_key_transitions_through_released() {
        let mut keypad = Keypad::new();
        keypad.press(0x3);
        keypad.release(0x3);
        assert_eq!(keypad.state(0x3), KeyState::Released);
        keypad.settle_released();
        assert_eq!(keypad.state(0x3), KeyState::Up);
    }

    #[test]
    fn test_release_of_idle_key_stays_up() {
        let mut keypad = Keypad::new();
        keypad.release(0x3);
        assert_eq!(keypad.state(0x3), KeyState::Up);
    }

    #[test]
    fn test_first_released_scans_in_order() {
        let mut keypad = Keypad::new();
        assert_eq!(keypad.first_released(), None);
        keypad.press(0xB);
        keypad.press(0x4);
        keypad.release(0xB);
        keypad.release(0x4);
        assert_eq!(keypad.first_released(), Some(0x4));
    }

    #[test]
    fn test_key_numbers_wrap_to_pad_size() {
        let mut keypad = Keypad::new();
        keypad.press(0x13);
        assert_eq!(keypad.state(0x3), KeyState::Down);
    }
}
