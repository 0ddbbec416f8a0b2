use thiserror::Error;

/// Recoverable machine faults.
///
/// None of these abort the interpreter; `cycle` surfaces them to the caller,
/// which may log the fault and recover with [`crate::Machine::reset`]. The
/// machine state is left intact apart from the program counter having already
/// advanced past the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("memory access out of bounds at address {address:#06X}")]
    MemoryOutOfBounds { address: u16 },

    #[error("call would overflow the reserved stack region")]
    StackOverflow,

    #[error("return with no active call on the stack")]
    StackUnderflow,
}

/// Errors while loading a program image.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("program image is {size} bytes but only {capacity} fit above the start address")]
    TooLarge { size: usize, capacity: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
