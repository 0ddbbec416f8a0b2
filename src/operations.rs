use rand::Rng;

use crate::constants::{BIG_FONT_START, DISPLAY_HEIGHT, DISPLAY_WIDTH, FONT_START, STACK_END, STACK_START};
use crate::error::Fault;
use crate::instruction::Instruction;
use crate::keypad::KeyState;
use crate::machine::Machine;

/// Applies one decoded instruction to the machine.
///
/// PC has already been advanced past the instruction; handlers that jump,
/// skip, or block overwrite it. Unknown instructions are deliberately
/// ignored: historical interpreters were permissive and programs rely on it.
pub(crate) fn execute(machine: &mut Machine, instruction: Instruction) -> Result<(), Fault> {
    match instruction {
        Instruction::Halt => halt(machine),
        Instruction::Clear => machine.display.clear(),
        Instruction::Return => ret(machine)?,
        Instruction::ScrollDown(n) => machine.display.scroll(0, 1, n as usize),
        Instruction::ScrollUp(n) => machine.display.scroll(0, -1, n as usize),
        Instruction::ScrollRight => machine.display.scroll(1, 0, 4),
        Instruction::ScrollLeft => machine.display.scroll(-1, 0, 4),
        Instruction::Exit => machine.exit = true,
        Instruction::LoRes => set_resolution(machine, false),
        Instruction::HiRes => set_resolution(machine, true),
        Instruction::Jump(addr) => machine.pc = addr,
        Instruction::Call(addr) => call(machine, addr)?,
        Instruction::SkipEqImm(x, kk) => {
            if machine.v[x] == kk {
                skip(machine);
            }
        }
        Instruction::SkipNeImm(x, kk) => {
            if machine.v[x] != kk {
                skip(machine);
            }
        }
        Instruction::SkipEqReg(x, y) => {
            if machine.v[x] == machine.v[y] {
                skip(machine);
            }
        }
        Instruction::LoadImm(x, kk) => machine.v[x] = kk,
        Instruction::AddImm(x, kk) => machine.v[x] = machine.v[x].wrapping_add(kk),
        Instruction::Move(x, y) => machine.v[x] = machine.v[y],
        Instruction::Or(x, y) => machine.v[x] |= machine.v[y],
        Instruction::And(x, y) => machine.v[x] &= machine.v[y],
        Instruction::Xor(x, y) => machine.v[x] ^= machine.v[y],
        Instruction::AddReg(x, y) => add_reg(machine, x, y),
        Instruction::SubReg(x, y) => sub_reg(machine, x, y),
        Instruction::ShiftRight(x, y) => shift_right(machine, x, y),
        Instruction::SubFrom(x, y) => sub_from(machine, x, y),
        Instruction::ShiftLeft(x, y) => shift_left(machine, x, y),
        Instruction::SkipNeReg(x, y) => {
            if machine.v[x] != machine.v[y] {
                skip(machine);
            }
        }
        Instruction::LoadIndex(addr) => machine.i = addr,
        Instruction::JumpOffset(addr) => jump_offset(machine, addr),
        Instruction::Random(x, kk) => random(machine, x, kk),
        Instruction::Draw(x, y, n) => draw(machine, x, y, n)?,
        Instruction::SkipKeyDown(x) => {
            if machine.keypad.state(machine.v[x]) == KeyState::Down {
                skip(machine);
            }
        }
        Instruction::SkipKeyUp(x) => {
            if machine.keypad.state(machine.v[x]) == KeyState::Up {
                skip(machine);
            }
        }
        Instruction::ReadDelay(x) => machine.v[x] = machine.delay_timer,
        Instruction::WaitKey(x) => wait_key(machine, x),
        Instruction::SetDelay(x) => machine.delay_timer = machine.v[x],
        Instruction::SetSound(x) => machine.sound_timer = machine.v[x],
        Instruction::AddIndex(x) => machine.i = machine.i.wrapping_add(u16::from(machine.v[x])),
        Instruction::FontChar(x) => {
            machine.i = FONT_START + u16::from(machine.v[x]) * 5;
        }
        Instruction::BigFontChar(x) => {
            machine.i = BIG_FONT_START + u16::from(machine.v[x]) * 10;
        }
        Instruction::StoreBcd(x) => store_bcd(machine, x)?,
        Instruction::StoreRegs(x) => store_regs(machine, x)?,
        Instruction::LoadRegs(x) => load_regs(machine, x)?,
        // User-flag persistence is left to a storage collaborator.
        Instruction::SaveFlags(_) | Instruction::LoadFlags(_) => {}
        Instruction::Unknown(op) => {
            log::debug!("ignoring unknown opcode {:#06X}", op);
        }
    }
    Ok(())
}

/// Rewind PC so the same instruction refetches forever.
fn halt(machine: &mut Machine) {
    machine.pc = machine.pc.wrapping_sub(2);
}

/// PC += 2
fn skip(machine: &mut Machine) {
    machine.pc += 2;
}

/// STACK.push(PC); PC = addr
///
/// Return addresses live in the reserved memory region above the fonts; the
/// stack pointer is pre-incremented, so a call that would step past the
/// region faults before touching anything.
fn call(machine: &mut Machine, addr: u16) -> Result<(), Fault> {
    if machine.sp + 2 >= STACK_END {
        return Err(Fault::StackOverflow);
    }
    machine.sp += 2;
    machine.memory[machine.sp as usize] = (machine.pc >> 8) as u8;
    machine.memory[machine.sp as usize + 1] = (machine.pc & 0x00FF) as u8;
    machine.pc = addr;
    Ok(())
}

/// PC = STACK.pop()
fn ret(machine: &mut Machine) -> Result<(), Fault> {
    if machine.sp <= STACK_START {
        return Err(Fault::StackUnderflow);
    }
    let high = u16::from(machine.memory[machine.sp as usize]);
    let low = u16::from(machine.memory[machine.sp as usize + 1]);
    machine.pc = high << 8 | low;
    machine.sp -= 2;
    Ok(())
}

/// Vx += Vy; VF = carry
fn add_reg(machine: &mut Machine, x: usize, y: usize) {
    let (result, carry) = machine.v[x].overflowing_add(machine.v[y]);
    machine.v[x] = result;
    machine.v[0xF] = carry as u8;
}

/// Vx -= Vy; VF = no borrow
fn sub_reg(machine: &mut Machine, x: usize, y: usize) {
    let (result, borrow) = machine.v[x].overflowing_sub(machine.v[y]);
    machine.v[x] = result;
    machine.v[0xF] = !borrow as u8;
}

/// Vx = Vy - Vx; VF = no borrow
fn sub_from(machine: &mut Machine, x: usize, y: usize) {
    let (result, borrow) = machine.v[y].overflowing_sub(machine.v[x]);
    machine.v[x] = result;
    machine.v[0xF] = !borrow as u8;
}

/// Vx >>= 1; VF = shifted-out bit
///
/// Legacy first replaces Vx with Vy and shifts that.
fn shift_right(machine: &mut Machine, x: usize, y: usize) {
    let source = if machine.quirks.shift_vx_in_place {
        machine.v[x]
    } else {
        machine.v[y]
    };
    machine.v[x] = source >> 1;
    machine.v[0xF] = source & 0x01;
}

/// Vx <<= 1; VF = shifted-out bit
fn shift_left(machine: &mut Machine, x: usize, y: usize) {
    let source = if machine.quirks.shift_vx_in_place {
        machine.v[x]
    } else {
        machine.v[y]
    };
    machine.v[x] = source << 1;
    machine.v[0xF] = source >> 7;
}

/// PC = V0 + addr, or Vx + addr with the quirk (x = high nibble of addr)
fn jump_offset(machine: &mut Machine, addr: u16) {
    let base = if machine.quirks.jump_with_vx {
        machine.v[(addr >> 8) as usize]
    } else {
        machine.v[0x0]
    };
    machine.pc = u16::from(base) + addr;
}

/// Vx = random byte & kk
fn random(machine: &mut Machine, x: usize, kk: u8) {
    let byte: u8 = machine.rng.gen();
    machine.v[x] = byte & kk;
}

/// Store the first released key in Vx, or refetch this instruction next
/// cycle. This is the executor's only suspension point; it polls rather than
/// blocks, so the outer loop keeps cycling and feeding key events.
fn wait_key(machine: &mut Machine, x: usize) {
    match machine.keypad.first_released() {
        Some(key) => machine.v[x] = key,
        None => machine.pc = machine.pc.wrapping_sub(2),
    }
}

/// Toggle hi-res mode; the buffer is cleared on switch unless quirked.
fn set_resolution(machine: &mut Machine, hires: bool) {
    machine.display.hires = hires;
    if !machine.quirks.keep_display_on_mode_switch {
        machine.display.clear();
    }
}

/// mem[I..I+3] = BCD of Vx
fn store_bcd(machine: &mut Machine, x: usize) -> Result<(), Fault> {
    machine.check_span(machine.i, 3)?;
    let i = machine.i as usize;
    machine.memory[i] = (machine.v[x] / 100) % 10;
    machine.memory[i + 1] = (machine.v[x] / 10) % 10;
    machine.memory[i + 2] = machine.v[x] % 10;
    Ok(())
}

/// mem[I..=I+x] = V0..=Vx; legacy advances I past the block
fn store_regs(machine: &mut Machine, x: usize) -> Result<(), Fault> {
    machine.check_span(machine.i, x + 1)?;
    let i = machine.i as usize;
    machine.memory[i..=i + x].copy_from_slice(&machine.v[0x0..=x]);
    if !machine.quirks.index_unchanged {
        machine.i = machine.i.wrapping_add(x as u16 + 1);
    }
    Ok(())
}

/// V0..=Vx = mem[I..=I+x]; legacy advances I past the block
fn load_regs(machine: &mut Machine, x: usize) -> Result<(), Fault> {
    machine.check_span(machine.i, x + 1)?;
    let i = machine.i as usize;
    machine.v[0x0..=x].copy_from_slice(&machine.memory[i..=i + x]);
    if !machine.quirks.index_unchanged {
        machine.i = machine.i.wrapping_add(x as u16 + 1);
    }
    Ok(())
}

/// XOR a sprite from memory at I onto the framebuffer at (Vx, Vy).
///
/// n selects the height in bytes; n == 0 selects the wide 16x16 form (32
/// bytes) in hi-res or when the lo-res tall-sprite quirk is off, else the
/// 8x16 form. Wide sprites interleave their bytes: even bytes are the left
/// half of a row, odd bytes the right half. In lo-res every logical pixel
/// lands as a 2x2 block on the physical buffer.
///
/// VF reports collisions: 1 if any pixel was erased, or under the counting
/// quirk (hi-res only) the number of sprite rows that collided, with the two
/// halves of a wide row counted once. The clipped-rows quirk additionally
/// counts rows that fall below the bottom edge.
fn draw(machine: &mut Machine, x: usize, y: usize, n: u8) -> Result<(), Fault> {
    let mut vf: u8 = 0;

    let bytes = if n == 0 {
        if machine.display.hires || !machine.quirks.lores_tall_sprite {
            32
        } else {
            16
        }
    } else {
        n as usize
    };
    let rows = if bytes == 32 { 16 } else { bytes };

    let mut origin_x = machine.v[x] as usize;
    let mut origin_y = machine.v[y] as usize;

    if machine.display.hires && machine.quirks.count_clipped_rows {
        vf += (origin_y + rows).saturating_sub(DISPLAY_HEIGHT - 1) as u8;
    }

    // The origin wraps around the display unless sprites clip; individual
    // pixels past the edge never wrap either way.
    if !machine.quirks.clip_sprites {
        origin_x %= DISPLAY_WIDTH;
        origin_y %= DISPLAY_HEIGHT;
    }

    machine.check_span(machine.i, bytes)?;

    let scale = if machine.display.hires { 1 } else { 2 };
    let counting = machine.display.hires && machine.quirks.count_collisions;
    let mut prev_byte_collided = false;

    for byte in 0..bytes {
        let sprite_row = machine.memory[machine.i as usize + byte];
        let mut byte_collided = false;

        for bit in 0..8 {
            if sprite_row & (0x80 >> bit) == 0 {
                continue;
            }

            let y_offset = if bytes == 32 { byte / 2 } else { byte };
            let x_offset = if bytes == 32 && byte % 2 != 0 { bit + 8 } else { bit };

            for block_y in 0..scale {
                for block_x in 0..scale {
                    let px = (origin_x + x_offset) * scale + block_x;
                    let py = (origin_y + y_offset) * scale + block_y;
                    if px >= DISPLAY_WIDTH || py >= DISPLAY_HEIGHT {
                        continue;
                    }

                    let lit = machine.display.get_pixel(px, py);
                    machine.display.set_pixel(px, py, !lit);
                    if !lit {
                        continue;
                    }

                    if counting {
                        // The odd byte of a wide row only counts when the
                        // even byte of the same row did not.
                        if !byte_collided
                            && (bytes <= 16 || byte % 2 == 0 || !prev_byte_collided)
                        {
                            vf += 1;
                            byte_collided = true;
                        }
                    } else {
                        vf = 1;
                    }
                }
            }
        }

        prev_byte_collided = byte_collided;
    }

    machine.v[0xF] = vf;
    Ok(())
}
