//! Game Boy emulation entrypoint and associated functions and structures.
//!
//! Most of the meaningful publicly available functions and structures to
//! build a working emulator should be present here.
//!
//! # Examples
//!
//! Creates a simple [`GameBoy`] instance with an empty cartridge and runs
//! it for one complete frame.
//!
//! ```rust
//! use dotmatrix::gb::GameBoy;
//! let mut game_boy = GameBoy::new(None);
//! game_boy.load_rom_empty().unwrap();
//! let cycles = game_boy.next_frame();
//! println!("Ran {} cycles", cycles);
//! ```

use dotmatrix_common::{error::Error, util::read_file, util::SharedThread};
use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
};

use crate::{
    apu::Apu,
    cpu::Cpu,
    mmu::Mmu,
    pad::{Pad, PadKey},
    ppu::{Ppu, PpuMode, FRAME_BUFFER_SIZE, FRAME_CYCLES},
    rom::Cartridge,
    state::{load_state, save_state},
    timer::Timer,
};

/// Configuration of the core behavioural switches, everything not
/// listed here is a presentation concern of the embedding frontend.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GameBoyConfig {
    /// If the boot ROM sequence should be skipped, placing the
    /// machine directly in the post boot state.
    pub skip_bootrom: bool,

    /// The rate at which PCM audio samples are produced.
    pub audio_sample_rate: u32,

    /// Capacity of the audio ring buffer, in samples.
    pub audio_buffer_samples: u32,
}

impl Default for GameBoyConfig {
    fn default() -> Self {
        Self {
            skip_bootrom: true,
            audio_sample_rate: 44100,
            audio_buffer_samples: 512,
        }
    }
}

/// Aggregation structure allowing the bundling of the bus owned
/// components into a single element for easy MMU construction.
#[derive(Default)]
pub struct Components {
    pub pad: Pad,
    pub timer: Timer,
    pub apu: Apu,
}

/// Top level structure that abstracts the usage of the Game Boy
/// system, driving the CPU and distributing the elapsed cycles to
/// the remaining components.
///
/// Should serve as the main entry-point API.
pub struct GameBoy {
    /// The configuration the machine was built with, kept around
    /// so that a reset re-applies the same behaviour.
    config: GameBoyConfig,

    /// The CPU component, the main element of the system, when
    /// clocked the amount of cycles from it is used as reference
    /// for the rest of the components.
    cpu: Cpu,

    /// The PPU component, clocked with the cycle deltas produced
    /// by the CPU, accesses memory through the bus.
    ppu: Ppu,

    /// The memory bus, owns the cartridge, joypad, timer, APU and
    /// the raw memory arrays of the system.
    mmu: Mmu,
}

impl GameBoy {
    /// The T-cycle frequency at which the DMG machine runs.
    pub const CPU_FREQ: u32 = 4194304;

    pub fn new(config: Option<GameBoyConfig>) -> Self {
        let config = config.unwrap_or_default();
        let components = Components {
            pad: Pad::default(),
            timer: Timer::default(),
            apu: Apu::new(
                config.audio_sample_rate,
                config.audio_buffer_samples,
                Self::CPU_FREQ,
            ),
        };
        let mmu = Mmu::new(components);
        let mut game_boy = Self {
            config,
            cpu: Cpu::new(),
            ppu: Ppu::new(),
            mmu,
        };
        game_boy.reset();
        game_boy
    }

    /// Puts the complete machine back into its initial state, the
    /// loaded cartridge (if any) is kept in place.
    pub fn reset(&mut self) {
        self.ppu.reset();
        self.mmu.reset();
        self.cpu.reset();

        // without the boot skip the machine starts executing at
        // 0x0000, expecting a boot ROM to be loaded
        if !self.config.skip_bootrom {
            self.cpu.set_pc(0x0000);
        }
    }

    /// Advances the system by one CPU step, forwarding the elapsed
    /// cycles to the PPU, timer, APU and cartridge clock. Returns
    /// the number of T-cycles consumed.
    pub fn clock(&mut self) -> u8 {
        let cycles = self.cpu.clock(&mut self.mmu);
        self.clock_devices(cycles as u16);
        cycles
    }

    #[inline(always)]
    fn clock_devices(&mut self, cycles: u16) {
        self.ppu.clock(&mut self.mmu, cycles);
        self.mmu.clock_peripherals(cycles);
    }

    /// Runs the system until one frame worth of cycles (70 224) has
    /// been consumed, returning the effective cycle count. After the
    /// call the frame buffer contains the most recent frame.
    pub fn next_frame(&mut self) -> u32 {
        let mut elapsed = 0u32;
        while elapsed < FRAME_CYCLES {
            elapsed += self.clock() as u32;
        }
        self.ppu.ack_frame();
        elapsed
    }

    /// Clocks the emulator until the limit of cycles has been
    /// reached, returns the amount of cycles effectively clocked.
    pub fn clocks_cycles(&mut self, limit: u64) -> u64 {
        let mut cycles = 0u64;
        while cycles < limit {
            cycles += self.clock() as u64;
        }
        cycles
    }

    /// Function equivalent to `clock()` but that allows pre-emptive
    /// breaking of the loop when the PC reaches the given address.
    pub fn step_to(&mut self, addr: u16) -> u64 {
        let mut cycles = 0u64;
        while self.cpu.pc() != addr {
            cycles += self.clock() as u64;
        }
        cycles
    }

    pub fn key_press(&mut self, key: PadKey) {
        self.mmu.key_press(key);
    }

    pub fn key_lift(&mut self, key: PadKey) {
        self.mmu.key_lift(key);
    }

    pub fn frame_buffer(&self) -> &[u8; FRAME_BUFFER_SIZE] {
        self.ppu.frame_buffer()
    }

    /// The handle to the PCM audio ring buffer, to be drained by
    /// the host audio callback thread.
    pub fn audio_buffer(&self) -> SharedThread<VecDeque<i16>> {
        self.mmu.apu_i().audio_buffer()
    }

    pub fn load_cartridge(&mut self, rom: Cartridge) -> Result<&mut Cartridge, Error> {
        self.mmu.set_rom(rom);
        Ok(self.mmu.rom())
    }

    pub fn load_rom(&mut self, data: &[u8]) -> Result<&mut Cartridge, Error> {
        let rom = Cartridge::from_data(data)?;
        self.load_cartridge(rom)
    }

    pub fn load_rom_file(&mut self, path: &str) -> Result<&mut Cartridge, Error> {
        let data = read_file(path)?;
        self.load_rom(&data)
    }

    /// Loads a zero filled 32 KB cartridge, useful for testing
    /// and benchmarking purposes.
    pub fn load_rom_empty(&mut self) -> Result<&mut Cartridge, Error> {
        let data = [0u8; 32 * 1024];
        self.load_rom(&data)
    }

    /// Loads a boot ROM image and re-routes execution through it,
    /// the overlay unmaps itself once 0xFF50 is written.
    pub fn load_boot(&mut self, data: &[u8]) {
        self.mmu.write_boot(0x0000, data);
        self.cpu.set_pc(0x0000);
    }

    pub fn save_state(&self) -> Result<Vec<u8>, Error> {
        save_state(self)
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), Error> {
        load_state(self, data)
    }

    pub fn read_memory(&self, addr: u16) -> u8 {
        self.mmu.read(addr)
    }

    pub fn write_memory(&mut self, addr: u16, value: u8) {
        self.mmu.write(addr, value);
    }

    pub fn cpu(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn cpu_i(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    pub fn ppu_i(&self) -> &Ppu {
        &self.ppu
    }

    pub fn mmu(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn mmu_i(&self) -> &Mmu {
        &self.mmu
    }

    pub fn apu_i(&self) -> &Apu {
        self.mmu.apu_i()
    }

    pub fn timer_i(&self) -> &Timer {
        self.mmu.timer_i()
    }

    pub fn rom_i(&self) -> &Cartridge {
        self.mmu.rom_i()
    }

    pub fn ppu_mode(&self) -> PpuMode {
        self.ppu.mode()
    }

    pub fn ppu_frame(&self) -> u16 {
        self.ppu.frame_index()
    }

    pub fn config(&self) -> &GameBoyConfig {
        &self.config
    }

    pub fn description(&self) -> String {
        format!(
            "cycles: {}\npc: 0x{:04x}\nrom: {}",
            self.cpu_i().cycles(),
            self.cpu_i().pc(),
            self.rom_i().title()
        )
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Display for GameBoy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use crate::{pad::PadKey, ppu::FRAME_CYCLES};

    use super::GameBoy;

    fn build_game_boy() -> GameBoy {
        let mut game_boy = GameBoy::new(None);
        game_boy.load_rom_empty().unwrap();
        game_boy
    }

    #[test]
    fn test_nop_throughput() {
        let mut game_boy = build_game_boy();
        let base_cycles = game_boy.cpu_i().cycles();
        let elapsed = game_boy.next_frame();

        // a zero filled cartridge runs NOPs only, meaning 70224 / 4
        // instructions within one frame
        assert_eq!(elapsed, FRAME_CYCLES);
        assert_eq!(game_boy.cpu_i().cycles() - base_cycles, 70224);
        assert_eq!(game_boy.cpu_i().pc(), (0x0100u32 + (70224u32 / 4)) as u16);
    }

    #[test]
    fn test_frame_indexes() {
        let mut game_boy = build_game_boy();
        assert_eq!(game_boy.ppu_frame(), 0);
        game_boy.next_frame();
        assert_eq!(game_boy.ppu_frame(), 1);
        game_boy.next_frame();
        assert_eq!(game_boy.ppu_frame(), 2);
    }

    #[test]
    fn test_ly_is_always_in_range() {
        let mut game_boy = build_game_boy();
        for _ in 0..30000 {
            game_boy.clock();
            assert!(game_boy.read_memory(0xff44) <= 153);
        }
    }

    #[test]
    fn test_key_press_matrix() {
        let mut game_boy = build_game_boy();
        game_boy.write_memory(0xff00, 0x10);
        game_boy.key_press(PadKey::A);
        assert_eq!(game_boy.read_memory(0xff00) & 0x0f, 0x0e);
        // the press also raises the joypad interrupt
        assert_eq!(game_boy.read_memory(0xff0f) & 0x10, 0x10);

        game_boy.key_lift(PadKey::A);
        assert_eq!(game_boy.read_memory(0xff00) & 0x0f, 0x0f);
    }

    #[test]
    fn test_timer_interrupt_dispatch() {
        let mut game_boy = build_game_boy();
        // enables the timer interrupt and a fast TIMA cadence
        game_boy.write_memory(0xff0f, 0x00);
        game_boy.write_memory(0xffff, 0x04);
        game_boy.write_memory(0xff07, 0x05);
        game_boy.write_memory(0xff05, 0xff);
        game_boy.cpu().set_ime(true);

        // a handful of instructions is enough to overflow TIMA and
        // jump into the 0x50 timer handler
        let mut dispatched = false;
        for _ in 0..16 {
            game_boy.clock();
            if game_boy.cpu_i().pc() < 0x0100 {
                dispatched = true;
                break;
            }
        }
        assert!(dispatched);
        assert_eq!(game_boy.cpu_i().pc(), 0x0050);
    }

    #[test]
    fn test_mbc1_bank_select_end_to_end() {
        let mut game_boy = GameBoy::new(None);
        let mut data = vec![0u8; 4 * 0x4000];
        data[0x0147] = 0x03;
        data[0x0148] = 0x01;
        data[0x0149] = 0x02;
        data[0x8000] = 0x99;
        game_boy.load_rom(&data).unwrap();

        game_boy.write_memory(0x0000, 0x0a);
        game_boy.write_memory(0x2100, 0x02);
        assert_eq!(game_boy.read_memory(0x4000), 0x99);
    }

    #[test]
    fn test_boot_rom_overlay() {
        let mut game_boy = build_game_boy();
        let mut boot = [0u8; 256];
        boot[0] = 0x3e; // LD A, 0x42
        boot[1] = 0x42;
        game_boy.load_boot(&boot);

        assert_eq!(game_boy.cpu_i().pc(), 0x0000);
        game_boy.clock();
        assert_eq!(game_boy.cpu_i().cycles(), 8);
        assert_eq!(game_boy.cpu_i().a, 0x42);

        // writing to 0xFF50 unmaps the overlay back to the ROM
        game_boy.write_memory(0xff50, 0x01);
        assert_eq!(game_boy.read_memory(0x0000), 0x00);
    }
}
