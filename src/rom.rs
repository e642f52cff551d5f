//! Cartridge (ROM) related functions and structures.

use core::fmt;
use dotmatrix_common::{
    data::{read_into, read_u16, read_u32, read_u8, read_vec, write_bytes, write_u16, write_u32, write_u8},
    error::Error,
};
use std::{
    cmp::max,
    fmt::{Display, Formatter},
    io::Cursor,
    vec,
};

use crate::{debugln, state::StateComponent, warnln};

pub const ROM_BANK_SIZE: usize = 16384;
pub const RAM_BANK_SIZE: usize = 8192;

/// Size of the built-in MBC2 RAM, 512 half-byte cells.
pub const MBC2_RAM_SIZE: usize = 512;

/// Number of T-cycles that make up one second of RTC time.
pub const RTC_CYCLE_FREQ: u32 = 4194304;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RomType {
    RomOnly = 0x00,
    Mbc1 = 0x01,
    Mbc1Ram = 0x02,
    Mbc1RamBattery = 0x03,
    Mbc2 = 0x05,
    Mbc2Battery = 0x06,
    Mbc3TimerBattery = 0x0f,
    Mbc3TimerRamBattery = 0x10,
    Mbc3 = 0x11,
    Mbc3Ram = 0x12,
    Mbc3RamBattery = 0x13,
    Mbc5 = 0x19,
    Mbc5Ram = 0x1a,
    Mbc5RamBattery = 0x1b,
    Mbc5Rumble = 0x1c,
    Mbc5RumbleRam = 0x1d,
    Mbc5RumbleRamBattery = 0x1e,
    Unknown = 0xef,
}

impl RomType {
    pub fn description(&self) -> &'static str {
        match self {
            RomType::RomOnly => "ROM Only",
            RomType::Mbc1 => "MBC1",
            RomType::Mbc1Ram => "MBC1 + RAM",
            RomType::Mbc1RamBattery => "MBC1 + RAM + Battery",
            RomType::Mbc2 => "MBC2",
            RomType::Mbc2Battery => "MBC2 + Battery",
            RomType::Mbc3TimerBattery => "MBC3 + Timer + Battery",
            RomType::Mbc3TimerRamBattery => "MBC3 + Timer + RAM + Battery",
            RomType::Mbc3 => "MBC3",
            RomType::Mbc3Ram => "MBC3 + RAM",
            RomType::Mbc3RamBattery => "MBC3 + RAM + Battery",
            RomType::Mbc5 => "MBC5",
            RomType::Mbc5Ram => "MBC5 + RAM",
            RomType::Mbc5RamBattery => "MBC5 + RAM + Battery",
            RomType::Mbc5Rumble => "MBC5 + Rumble",
            RomType::Mbc5RumbleRam => "MBC5 + Rumble + RAM",
            RomType::Mbc5RumbleRamBattery => "MBC5 + Rumble + RAM + Battery",
            RomType::Unknown => "Unknown",
        }
    }
}

impl Display for RomType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RomSize {
    Size32K,
    Size64K,
    Size128K,
    Size256K,
    Size512K,
    Size1M,
    Size2M,
    Size4M,
    Size8M,
    SizeUnknown,
}

impl RomSize {
    pub fn description(&self) -> &'static str {
        match self {
            RomSize::Size32K => "32 KB",
            RomSize::Size64K => "64 KB",
            RomSize::Size128K => "128 KB",
            RomSize::Size256K => "256 KB",
            RomSize::Size512K => "512 KB",
            RomSize::Size1M => "1 MB",
            RomSize::Size2M => "2 MB",
            RomSize::Size4M => "4 MB",
            RomSize::Size8M => "8 MB",
            RomSize::SizeUnknown => "Unknown",
        }
    }

    pub fn rom_banks(&self) -> u16 {
        match self {
            RomSize::Size32K => 2,
            RomSize::Size64K => 4,
            RomSize::Size128K => 8,
            RomSize::Size256K => 16,
            RomSize::Size512K => 32,
            RomSize::Size1M => 64,
            RomSize::Size2M => 128,
            RomSize::Size4M => 256,
            RomSize::Size8M => 512,
            RomSize::SizeUnknown => 0,
        }
    }
}

impl Display for RomSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RamSize {
    NoRam,
    Size2K,
    Size8K,
    Size32K,
    Size64K,
    Size128K,
    SizeUnknown,
}

impl RamSize {
    pub fn description(&self) -> &'static str {
        match self {
            RamSize::NoRam => "No RAM",
            RamSize::Size2K => "2 KB",
            RamSize::Size8K => "8 KB",
            RamSize::Size32K => "32 KB",
            RamSize::Size64K => "64 KB",
            RamSize::Size128K => "128 KB",
            RamSize::SizeUnknown => "Unknown",
        }
    }

    pub fn ram_banks(&self) -> u16 {
        match self {
            RamSize::NoRam => 0,
            RamSize::Size2K => 1,
            RamSize::Size8K => 1,
            RamSize::Size32K => 4,
            RamSize::Size64K => 8,
            RamSize::Size128K => 16,
            RamSize::SizeUnknown => 0,
        }
    }
}

impl Display for RamSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Real time clock present in MBC3 cartridges, the live counters
/// advance from emulated T-cycles so that the complete system stays
/// deterministic, the latched copies are the values exposed through
/// the 0xA000-0xBFFF window after a 0x00/0x01 latch sequence.
#[derive(Clone)]
pub struct Rtc {
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub day_low: u8,
    pub day_high: u8,
    latched_regs: [u8; 5],
    latched: bool,
    latch_prev: u8,
    cycle_clock: u32,
}

impl Rtc {
    pub fn new() -> Self {
        Self {
            seconds: 0,
            minutes: 0,
            hours: 0,
            day_low: 0,
            day_high: 0,
            latched_regs: [0u8; 5],
            latched: false,
            latch_prev: 0xff,
            cycle_clock: 0,
        }
    }

    pub fn clock(&mut self, cycles: u16) {
        // halt flag set means the oscillator is stopped
        if self.day_high & 0x40 == 0x40 {
            return;
        }
        self.cycle_clock += cycles as u32;
        while self.cycle_clock >= RTC_CYCLE_FREQ {
            self.tick_second();
            self.cycle_clock -= RTC_CYCLE_FREQ;
        }
    }

    fn tick_second(&mut self) {
        self.seconds = (self.seconds + 1) % 60;
        if self.seconds != 0 {
            return;
        }
        self.minutes = (self.minutes + 1) % 60;
        if self.minutes != 0 {
            return;
        }
        self.hours = (self.hours + 1) % 24;
        if self.hours != 0 {
            return;
        }
        let days = ((((self.day_high & 0x01) as u16) << 8) | self.day_low as u16) + 1;
        self.day_low = days as u8;
        self.day_high = (self.day_high & 0xfe) | ((days >> 8) as u8 & 0x01);
        if days > 0x1ff {
            self.day_high |= 0x80;
        }
    }

    /// Handles a write to the latch register (0x6000-0x7FFF), a
    /// 0x00 write followed by a 0x01 write copies the live clock
    /// into the latched registers.
    pub fn write_latch(&mut self, value: u8) {
        if self.latch_prev == 0x00 && value == 0x01 {
            self.latched_regs = [
                self.seconds,
                self.minutes,
                self.hours,
                self.day_low,
                self.day_high,
            ];
            self.latched = true;
        }
        self.latch_prev = value;
    }

    /// Reads one of the clock registers (0x08-0x0C), the latched
    /// copy is used once a latch sequence has been performed.
    pub fn read(&self, reg: u8) -> u8 {
        let index = (reg - 0x08) as usize;
        if self.latched {
            self.latched_regs[index]
        } else {
            match index {
                0 => self.seconds,
                1 => self.minutes,
                2 => self.hours,
                3 => self.day_low,
                _ => self.day_high,
            }
        }
    }

    pub fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0x08 => self.seconds = value % 60,
            0x09 => self.minutes = value % 60,
            0x0a => self.hours = value % 24,
            0x0b => self.day_low = value,
            _ => self.day_high = value & 0xc1,
        }
    }
}

impl StateComponent for Rtc {
    fn state(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = Cursor::new(vec![]);
        write_u8(&mut cursor, self.seconds)?;
        write_u8(&mut cursor, self.minutes)?;
        write_u8(&mut cursor, self.hours)?;
        write_u8(&mut cursor, self.day_low)?;
        write_u8(&mut cursor, self.day_high)?;
        write_bytes(&mut cursor, &self.latched_regs)?;
        write_u8(&mut cursor, self.latched as u8)?;
        write_u8(&mut cursor, self.latch_prev)?;
        write_u32(&mut cursor, self.cycle_clock)?;
        Ok(cursor.into_inner())
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut cursor = Cursor::new(data);
        self.seconds = read_u8(&mut cursor)?;
        self.minutes = read_u8(&mut cursor)?;
        self.hours = read_u8(&mut cursor)?;
        self.day_low = read_u8(&mut cursor)?;
        self.day_high = read_u8(&mut cursor)?;
        read_into(&mut cursor, &mut self.latched_regs)?;
        self.latched = read_u8(&mut cursor)? != 0;
        self.latch_prev = read_u8(&mut cursor)?;
        self.cycle_clock = read_u32(&mut cursor)?;
        Ok(())
    }
}

impl Default for Rtc {
    fn default() -> Self {
        Self::new()
    }
}

/// Structure that defines the ROM and RAM contents of a Game Boy
/// cartridge. Should correctly address the specifics of all the
/// supported MBCs (Memory Bank Controllers).
#[derive(Clone)]
pub struct Cartridge {
    /// The complete data of the ROM cartridge, should
    /// include the complete set of ROM banks.
    rom_data: Vec<u8>,

    /// The external RAM that may be used by the cartridge
    /// for save games and other persistent data.
    ram_data: Vec<u8>,

    /// The MBC (Memory Bank Controller) in charge of handling
    /// the memory access for the current cartridge.
    mbc: &'static Mbc,

    /// The number of ROM banks (16 KB) available to the
    /// current cartridge, computed from the header.
    rom_bank_count: u16,

    /// The number of RAM banks (8 KB) available to the
    /// current cartridge, computed from the header.
    ram_bank_count: u16,

    /// The offset address of the switchable ROM bank that
    /// is currently mapped at 0x4000-0x7FFF.
    rom_offset: usize,

    /// The offset address of the external RAM bank that is
    /// currently mapped at 0xA000-0xBFFF.
    ram_offset: usize,

    /// If external RAM access is currently enabled, writes
    /// while disabled are silently dropped.
    ram_enabled: bool,

    /// The raw value last written to the RAM bank selection
    /// region, values 0x08-0x0C select RTC registers (MBC3).
    ram_select: u8,

    /// Banking mode bit for MBC1, selects between ROM (0)
    /// and RAM (1) banking behaviour of the upper bits.
    banking_mode: u8,

    /// The real time clock exposed by MBC3 cartridges.
    rtc: Rtc,
}

impl Cartridge {
    pub fn new() -> Self {
        Self {
            rom_data: vec![],
            ram_data: vec![],
            mbc: &NO_MBC,
            rom_bank_count: 0,
            ram_bank_count: 0,
            rom_offset: 0x4000,
            ram_offset: 0x0000,
            ram_enabled: false,
            ram_select: 0x0,
            banking_mode: 0x0,
            rtc: Rtc::new(),
        }
    }

    pub fn from_data(data: &[u8]) -> Result<Self, Error> {
        let mut cartridge = Cartridge::new();
        cartridge.set_data(data)?;
        Ok(cartridge)
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7fff => (self.mbc.read_rom)(self, addr),
            0xa000..=0xbfff => (self.mbc.read_ram)(self, addr),
            _ => {
                debugln!("Reading from unknown Cartridge location 0x{:04x}", addr);
                0x00
            }
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x7fff => (self.mbc.write_rom)(self, addr, value),
            0xa000..=0xbfff => (self.mbc.write_ram)(self, addr, value),
            _ => debugln!("Writing to unknown Cartridge location 0x{:04x}", addr),
        }
    }

    pub fn reset(&mut self) {
        self.rom_data = vec![];
        self.ram_data = vec![];
        self.mbc = &NO_MBC;
        self.rom_bank_count = 0;
        self.ram_bank_count = 0;
        self.rom_offset = 0x4000;
        self.ram_offset = 0x0000;
        self.ram_enabled = false;
        self.ram_select = 0x0;
        self.banking_mode = 0x0;
        self.rtc = Rtc::new();
    }

    /// Advances the cartridge clock (RTC) by the provided
    /// number of T-cycles, a no-op for non MBC3 cartridges.
    pub fn clock(&mut self, cycles: u16) {
        if self.has_rtc() {
            self.rtc.clock(cycles);
        }
    }

    pub fn ram_enabled(&self) -> bool {
        self.ram_enabled
    }

    pub fn ram_bank(&self) -> u8 {
        (self.ram_offset / RAM_BANK_SIZE) as u8
    }

    pub fn set_ram_bank(&mut self, ram_bank: u8) {
        self.ram_offset = ram_bank as usize * RAM_BANK_SIZE;
    }

    pub fn rom_bank(&self) -> u16 {
        (self.rom_offset / ROM_BANK_SIZE) as u16
    }

    pub fn set_rom_bank(&mut self, rom_bank: u16) {
        self.rom_offset = rom_bank as usize * ROM_BANK_SIZE;
    }

    pub fn rtc(&self) -> &Rtc {
        &self.rtc
    }

    pub fn rtc_mut(&mut self) -> &mut Rtc {
        &mut self.rtc
    }

    fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.ensure_data(data)?;
        self.rom_data = data.to_vec();
        self.set_mbc();
        self.set_computed();
        self.allocate_ram();
        self.set_rom_bank(1);
        self.set_ram_bank(0);
        Ok(())
    }

    fn set_mbc(&mut self) {
        self.mbc = match self.rom_type() {
            RomType::RomOnly => &NO_MBC,
            RomType::Mbc1 | RomType::Mbc1Ram | RomType::Mbc1RamBattery => &MBC1,
            RomType::Mbc2 | RomType::Mbc2Battery => &MBC2,
            RomType::Mbc3
            | RomType::Mbc3Ram
            | RomType::Mbc3RamBattery
            | RomType::Mbc3TimerBattery
            | RomType::Mbc3TimerRamBattery => &MBC3,
            RomType::Mbc5
            | RomType::Mbc5Ram
            | RomType::Mbc5RamBattery
            | RomType::Mbc5Rumble
            | RomType::Mbc5RumbleRam
            | RomType::Mbc5RumbleRamBattery => &MBC5,
            rom_type => {
                warnln!(
                    "No MBC controller available for {} (0x{:02x}), falling back to ROM only",
                    rom_type,
                    self.rom_data[0x0147]
                );
                &NO_MBC
            }
        };
    }

    fn set_computed(&mut self) {
        self.rom_bank_count = self.rom_size().rom_banks();
        self.ram_bank_count = self.ram_size().ram_banks();
    }

    fn allocate_ram(&mut self) {
        if self.rom_type() == RomType::Mbc2 || self.rom_type() == RomType::Mbc2Battery {
            self.ram_data = vec![0u8; MBC2_RAM_SIZE];
            return;
        }
        let mut ram_banks = self.ram_size().ram_banks();
        if self.ram_size() == RamSize::SizeUnknown {
            warnln!(
                "Unsupported RAM size code 0x{:02x}, defaulting to 32 KB",
                self.rom_data[0x0149]
            );
            ram_banks = 4;
            self.ram_bank_count = ram_banks;
        }
        self.ram_data = vec![0u8; max(ram_banks, 1) as usize * RAM_BANK_SIZE];
    }

    /// Ensures that the data provided is large enough to contain
    /// a valid Game Boy cartridge header.
    fn ensure_data(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() < 0x0150 {
            return Err(Error::RomSize);
        }
        Ok(())
    }

    pub fn title(&self) -> String {
        if self.rom_data.len() < 0x0144 {
            return String::new();
        }
        let title = &self.rom_data[0x0134..=0x0143];
        let end = title.iter().position(|&byte| byte == 0).unwrap_or(title.len());
        String::from(std::str::from_utf8(&title[..end]).unwrap_or("").trim())
    }

    pub fn rom_type(&self) -> RomType {
        if self.rom_data.len() < 0x0148 {
            return RomType::Unknown;
        }
        match self.rom_data[0x0147] {
            0x00 => RomType::RomOnly,
            0x01 => RomType::Mbc1,
            0x02 => RomType::Mbc1Ram,
            0x03 => RomType::Mbc1RamBattery,
            0x05 => RomType::Mbc2,
            0x06 => RomType::Mbc2Battery,
            0x0f => RomType::Mbc3TimerBattery,
            0x10 => RomType::Mbc3TimerRamBattery,
            0x11 => RomType::Mbc3,
            0x12 => RomType::Mbc3Ram,
            0x13 => RomType::Mbc3RamBattery,
            0x19 => RomType::Mbc5,
            0x1a => RomType::Mbc5Ram,
            0x1b => RomType::Mbc5RamBattery,
            0x1c => RomType::Mbc5Rumble,
            0x1d => RomType::Mbc5RumbleRam,
            0x1e => RomType::Mbc5RumbleRamBattery,
            _ => RomType::Unknown,
        }
    }

    pub fn rom_size(&self) -> RomSize {
        if self.rom_data.len() < 0x0149 {
            return RomSize::SizeUnknown;
        }
        match self.rom_data[0x0148] {
            0x00 => RomSize::Size32K,
            0x01 => RomSize::Size64K,
            0x02 => RomSize::Size128K,
            0x03 => RomSize::Size256K,
            0x04 => RomSize::Size512K,
            0x05 => RomSize::Size1M,
            0x06 => RomSize::Size2M,
            0x07 => RomSize::Size4M,
            0x08 => RomSize::Size8M,
            _ => RomSize::SizeUnknown,
        }
    }

    pub fn ram_size(&self) -> RamSize {
        if self.rom_data.len() < 0x014a {
            return RamSize::SizeUnknown;
        }
        match self.rom_data[0x0149] {
            0x00 => RamSize::NoRam,
            0x01 => RamSize::Size2K,
            0x02 => RamSize::Size8K,
            0x03 => RamSize::Size32K,
            0x04 => RamSize::Size128K,
            0x05 => RamSize::Size64K,
            _ => RamSize::SizeUnknown,
        }
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.rom_type(),
            RomType::Mbc1RamBattery
                | RomType::Mbc2Battery
                | RomType::Mbc3TimerBattery
                | RomType::Mbc3TimerRamBattery
                | RomType::Mbc3RamBattery
                | RomType::Mbc5RamBattery
                | RomType::Mbc5RumbleRamBattery
        )
    }

    pub fn has_rtc(&self) -> bool {
        matches!(
            self.rom_type(),
            RomType::Mbc3TimerBattery | RomType::Mbc3TimerRamBattery
        )
    }

    pub fn checksum(&self) -> u8 {
        let mut sum: u8 = 0;
        for i in 0x0134..=0x014c {
            sum = sum.wrapping_sub(self.rom_data[i]).wrapping_sub(1);
        }
        sum
    }

    pub fn valid_checksum(&self) -> bool {
        self.rom_data[0x014d] == self.checksum()
    }

    pub fn rom_data(&self) -> &Vec<u8> {
        &self.rom_data
    }

    pub fn ram_data(&self) -> &Vec<u8> {
        &self.ram_data
    }

    pub fn set_ram_data(&mut self, data: &[u8]) {
        self.ram_data = data.to_vec();
    }

    pub fn description(&self, column_length: usize) -> String {
        let title_l = format!("{:width$}", "Title", width = column_length);
        let type_l = format!("{:width$}", "Type", width = column_length);
        let rom_size_l = format!("{:width$}", "ROM Size", width = column_length);
        let ram_size_l = format!("{:width$}", "RAM Size", width = column_length);
        format!(
            "{}  {}\n{}  {}\n{}  {}\n{}  {}",
            title_l,
            self.title(),
            type_l,
            self.rom_type(),
            rom_size_l,
            self.rom_size(),
            ram_size_l,
            self.ram_size()
        )
    }
}

impl StateComponent for Cartridge {
    fn state(&self) -> Result<Vec<u8>, Error> {
        let mut cursor = Cursor::new(vec![]);
        write_u32(&mut cursor, self.ram_data.len() as u32)?;
        write_bytes(&mut cursor, &self.ram_data)?;
        write_u16(&mut cursor, self.rom_bank())?;
        write_u8(&mut cursor, self.ram_bank())?;
        write_u8(&mut cursor, self.ram_select)?;
        write_u8(&mut cursor, self.ram_enabled as u8)?;
        write_u8(&mut cursor, self.banking_mode)?;
        write_bytes(&mut cursor, &self.rtc.state()?)?;
        Ok(cursor.into_inner())
    }

    fn set_state(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut cursor = Cursor::new(data);
        let ram_size = read_u32(&mut cursor)? as usize;
        self.ram_data = read_vec(&mut cursor, ram_size)?;
        let rom_bank = read_u16(&mut cursor)?;
        self.set_rom_bank(rom_bank);
        let ram_bank = read_u8(&mut cursor)?;
        self.set_ram_bank(ram_bank);
        self.ram_select = read_u8(&mut cursor)?;
        self.ram_enabled = read_u8(&mut cursor)? != 0;
        self.banking_mode = read_u8(&mut cursor)?;
        let offset = cursor.position() as usize;
        self.rtc.set_state(&data[offset..])?;
        Ok(())
    }
}

impl Default for Cartridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Cartridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description(9))
    }
}

pub struct Mbc {
    pub name: &'static str,
    pub read_rom: fn(rom: &Cartridge, addr: u16) -> u8,
    pub write_rom: fn(rom: &mut Cartridge, addr: u16, value: u8),
    pub read_ram: fn(rom: &Cartridge, addr: u16) -> u8,
    pub write_ram: fn(rom: &mut Cartridge, addr: u16, value: u8),
}

/// Reads from the switchable window using the current ROM offset,
/// out-of-range banked reads resolve to 0x00.
fn read_rom_banked(rom: &Cartridge, addr: u16) -> u8 {
    match addr {
        0x0000..=0x3fff => *rom.rom_data.get(addr as usize).unwrap_or(&0xff),
        _ => *rom
            .rom_data
            .get(rom.rom_offset + (addr - 0x4000) as usize)
            .unwrap_or(&0x00),
    }
}

pub static NO_MBC: Mbc = Mbc {
    name: "No MBC",
    read_rom: |rom: &Cartridge, addr: u16| -> u8 {
        *rom.rom_data.get(addr as usize).unwrap_or(&0xff)
    },
    write_rom: |_rom: &mut Cartridge, addr: u16, _value: u8| {
        // some games (eg: Tetris) write to the bank selection
        // region even without an MBC in place
        debugln!("Ignored ROM only cartridge write at 0x{:04x}", addr);
    },
    read_ram: |rom: &Cartridge, addr: u16| -> u8 {
        *rom.ram_data.get((addr - 0xa000) as usize).unwrap_or(&0xff)
    },
    write_ram: |rom: &mut Cartridge, addr: u16, value: u8| {
        let index = (addr - 0xa000) as usize;
        if index < rom.ram_data.len() {
            rom.ram_data[index] = value;
        }
    },
};

pub static MBC1: Mbc = Mbc {
    name: "MBC1",
    read_rom: read_rom_banked,
    write_rom: |rom: &mut Cartridge, addr: u16, value: u8| {
        match addr {
            // 0x0000-0x1FFF - RAM enable
            0x0000..=0x1fff => {
                rom.ram_enabled = (value & 0x0f) == 0x0a;
            }
            // 0x2000-0x3FFF - ROM bank selection, 5 lower bits
            0x2000..=0x3fff => {
                let mut rom_bank = (value & 0x1f) as u16;
                if rom_bank == 0 {
                    rom_bank = 1;
                }
                rom_bank = (rom.rom_bank() & 0x60) | rom_bank;
                rom_bank &= rom.rom_bank_count.saturating_sub(1).max(1);
                rom.set_rom_bank(rom_bank);
            }
            // 0x4000-0x5FFF - RAM bank selection or ROM bank upper bits
            0x4000..=0x5fff => {
                if rom.banking_mode == 0x0 {
                    let mut rom_bank = (rom.rom_bank() & 0x1f) | (((value & 0x03) as u16) << 5);
                    rom_bank &= rom.rom_bank_count.saturating_sub(1).max(1);
                    if rom_bank == 0 {
                        rom_bank = 1;
                    }
                    rom.set_rom_bank(rom_bank);
                } else {
                    let ram_bank = value & 0x03;
                    if (ram_bank as u16) < rom.ram_bank_count {
                        rom.set_ram_bank(ram_bank);
                    }
                }
            }
            // 0x6000-0x7FFF - Banking mode selection
            0x6000..=0x7fff => {
                rom.banking_mode = value & 0x01;
            }
            _ => warnln!("Writing to unknown Cartridge ROM location 0x{:04x}", addr),
        }
    },
    read_ram: |rom: &Cartridge, addr: u16| -> u8 {
        if !rom.ram_enabled {
            return 0xff;
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize]
    },
    write_ram: |rom: &mut Cartridge, addr: u16, value: u8| {
        if !rom.ram_enabled {
            debugln!("Attempt to write to ERAM while write protect is active");
            return;
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize] = value;
    },
};

pub static MBC2: Mbc = Mbc {
    name: "MBC2",
    read_rom: read_rom_banked,
    write_rom: |rom: &mut Cartridge, addr: u16, value: u8| {
        match addr {
            // 0x0000-0x3FFF - RAM enable or ROM bank selection,
            // distinguished by bit 8 of the address
            0x0000..=0x3fff => {
                if addr & 0x0100 == 0x0000 {
                    rom.ram_enabled = (value & 0x0f) == 0x0a;
                } else {
                    let mut rom_bank = (value & 0x0f) as u16;
                    if rom_bank == 0 {
                        rom_bank = 1;
                    }
                    rom_bank &= rom.rom_bank_count.saturating_sub(1).max(1);
                    rom.set_rom_bank(rom_bank);
                }
            }
            _ => debugln!("Ignored MBC2 write at 0x{:04x}", addr),
        }
    },
    read_ram: |rom: &Cartridge, addr: u16| -> u8 {
        if !rom.ram_enabled {
            return 0xff;
        }
        // built-in RAM is made of 512 half bytes, only the low 9
        // address bits decode and the upper nibble reads as zero
        rom.ram_data[(addr & 0x01ff) as usize] & 0x0f
    },
    write_ram: |rom: &mut Cartridge, addr: u16, value: u8| {
        if !rom.ram_enabled {
            return;
        }
        rom.ram_data[(addr & 0x01ff) as usize] = value & 0x0f;
    },
};

pub static MBC3: Mbc = Mbc {
    name: "MBC3",
    read_rom: read_rom_banked,
    write_rom: |rom: &mut Cartridge, addr: u16, value: u8| {
        match addr {
            // 0x0000-0x1FFF - RAM and RTC enable
            0x0000..=0x1fff => {
                rom.ram_enabled = (value & 0x0f) == 0x0a;
            }
            // 0x2000-0x3FFF - ROM bank selection, 7 bits
            0x2000..=0x3fff => {
                let mut rom_bank = (value & 0x7f) as u16;
                if rom_bank == 0 {
                    rom_bank = 1;
                }
                rom_bank &= rom.rom_bank_count.saturating_sub(1).max(1);
                rom.set_rom_bank(rom_bank);
            }
            // 0x4000-0x5FFF - RAM bank or RTC register selection
            0x4000..=0x5fff => {
                rom.ram_select = value;
                if value <= 0x03 && (value as u16) < rom.ram_bank_count.max(1) {
                    rom.set_ram_bank(value);
                }
            }
            // 0x6000-0x7FFF - RTC latch sequence
            0x6000..=0x7fff => {
                rom.rtc.write_latch(value);
            }
            _ => warnln!("Writing to unknown Cartridge ROM location 0x{:04x}", addr),
        }
    },
    read_ram: |rom: &Cartridge, addr: u16| -> u8 {
        if !rom.ram_enabled {
            return 0xff;
        }
        if (0x08..=0x0c).contains(&rom.ram_select) {
            return rom.rtc.read(rom.ram_select);
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize]
    },
    write_ram: |rom: &mut Cartridge, addr: u16, value: u8| {
        if !rom.ram_enabled {
            return;
        }
        if (0x08..=0x0c).contains(&rom.ram_select) {
            rom.rtc.write(rom.ram_select, value);
            return;
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize] = value;
    },
};

pub static MBC5: Mbc = Mbc {
    name: "MBC5",
    read_rom: read_rom_banked,
    write_rom: |rom: &mut Cartridge, addr: u16, value: u8| {
        match addr {
            // 0x0000-0x1FFF - RAM enable
            0x0000..=0x1fff => {
                rom.ram_enabled = (value & 0x0f) == 0x0a;
            }
            // 0x2000-0x2FFF - ROM bank selection, 8 lower bits,
            // bank 0 is a legal selection for MBC5
            0x2000..=0x2fff => {
                let rom_bank = (rom.rom_bank() & 0x0100) | value as u16;
                rom.set_rom_bank(rom_bank % rom.rom_bank_count.max(1));
            }
            // 0x3000-0x3FFF - ROM bank selection, 9th bit
            0x3000..=0x3fff => {
                let rom_bank = (rom.rom_bank() & 0x00ff) | (((value & 0x01) as u16) << 8);
                rom.set_rom_bank(rom_bank % rom.rom_bank_count.max(1));
            }
            // 0x4000-0x5FFF - RAM bank selection, 4 bits
            0x4000..=0x5fff => {
                let ram_bank = value & 0x0f;
                if (ram_bank as u16) < rom.ram_bank_count {
                    rom.set_ram_bank(ram_bank);
                }
            }
            _ => warnln!("Writing to unknown Cartridge ROM location 0x{:04x}", addr),
        }
    },
    read_ram: |rom: &Cartridge, addr: u16| -> u8 {
        if !rom.ram_enabled {
            return 0xff;
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize]
    },
    write_ram: |rom: &mut Cartridge, addr: u16, value: u8| {
        if !rom.ram_enabled {
            return;
        }
        rom.ram_data[rom.ram_offset + (addr - 0xa000) as usize] = value;
    },
};

#[cfg(test)]
mod tests {
    use crate::state::StateComponent;

    use super::{Cartridge, RamSize, RomType};

    fn build_rom(rom_type: u8, rom_size: u8, ram_size: u8) -> Vec<u8> {
        let banks = 2usize << rom_size;
        let mut data = vec![0u8; banks * 0x4000];
        data[0x0147] = rom_type;
        data[0x0148] = rom_size;
        data[0x0149] = ram_size;
        // stamps every bank with its own index so that bank
        // switching is observable from the outside
        for bank in 0..banks {
            data[bank * 0x4000] = bank as u8;
            data[bank * 0x4000 + 1] = (bank >> 8) as u8;
        }
        data
    }

    #[test]
    fn test_load_too_small() {
        assert!(Cartridge::from_data(&[0u8; 0x014f]).is_err());
        assert!(Cartridge::from_data(&build_rom(0x00, 0x00, 0x00)).is_ok());
    }

    #[test]
    fn test_header_fields() {
        let mut data = build_rom(0x13, 0x01, 0x03);
        data[0x0134..0x0134 + 4].copy_from_slice(b"ZELD");
        let rom = Cartridge::from_data(&data).unwrap();
        assert_eq!(rom.rom_type(), RomType::Mbc3RamBattery);
        assert_eq!(rom.ram_size(), RamSize::Size32K);
        assert_eq!(rom.title(), "ZELD");
        assert!(rom.has_battery());
    }

    #[test]
    fn test_unknown_mbc_falls_back_to_rom_only() {
        let data = build_rom(0xfd, 0x00, 0x00);
        let rom = Cartridge::from_data(&data).unwrap();
        assert_eq!(rom.rom_type(), RomType::Unknown);
        assert_eq!(rom.read(0x0000), 0x00);
        assert_eq!(rom.read(0x4000), 0x01);
    }

    #[test]
    fn test_mbc1_bank_select() {
        let data = build_rom(0x01, 0x02, 0x02);
        let mut rom = Cartridge::from_data(&data).unwrap();

        rom.write(0x0000, 0x0a);
        assert!(rom.ram_enabled());

        rom.write(0x2100, 0x02);
        assert_eq!(rom.rom_bank(), 2);
        assert_eq!(rom.read(0x4000), data[0x8000]);

        // a written value of zero selects bank 1
        rom.write(0x2100, 0x00);
        assert_eq!(rom.rom_bank(), 1);
    }

    #[test]
    fn test_mbc1_ram_disabled_write_ignored() {
        let data = build_rom(0x03, 0x00, 0x02);
        let mut rom = Cartridge::from_data(&data).unwrap();
        rom.write(0xa000, 0x42);
        assert_eq!(rom.ram_data()[0], 0x00);
        assert_eq!(rom.read(0xa000), 0xff);

        rom.write(0x0000, 0x0a);
        rom.write(0xa000, 0x42);
        assert_eq!(rom.read(0xa000), 0x42);
    }

    #[test]
    fn test_mbc2_rom_bank_and_nibble_ram() {
        let data = build_rom(0x05, 0x02, 0x00);
        let mut rom = Cartridge::from_data(&data).unwrap();

        // bit 8 clear selects the RAM enable register
        rom.write(0x0000, 0x0a);
        assert!(rom.ram_enabled());

        // bit 8 set selects the ROM bank register
        rom.write(0x0100, 0x03);
        assert_eq!(rom.rom_bank(), 3);
        assert_eq!(rom.read(0x4000), 0x03);

        rom.write(0xa000, 0xff);
        assert_eq!(rom.read(0xa000), 0x0f);

        // addresses wrap every 512 bytes
        assert_eq!(rom.read(0xa200), 0x0f);
    }

    #[test]
    fn test_mbc3_rtc_latch() {
        let data = build_rom(0x10, 0x02, 0x03);
        let mut rom = Cartridge::from_data(&data).unwrap();
        rom.write(0x0000, 0x0a);

        rom.rtc_mut().seconds = 12;
        rom.rtc_mut().minutes = 34;

        // selects the seconds RTC register and latches
        rom.write(0x4000, 0x08);
        rom.write(0x6000, 0x00);
        rom.write(0x6000, 0x01);
        assert_eq!(rom.read(0xa000), 12);

        // live clock changes are not visible until re-latched
        rom.rtc_mut().seconds = 55;
        assert_eq!(rom.read(0xa000), 12);
        rom.write(0x6000, 0x00);
        rom.write(0x6000, 0x01);
        assert_eq!(rom.read(0xa000), 55);

        rom.write(0x4000, 0x09);
        assert_eq!(rom.read(0xa000), 34);

        // back to a plain RAM bank
        rom.write(0x4000, 0x00);
        rom.write(0xa000, 0x77);
        assert_eq!(rom.read(0xa000), 0x77);
    }

    #[test]
    fn test_mbc3_rtc_cycle_clock() {
        let data = build_rom(0x0f, 0x02, 0x00);
        let mut rom = Cartridge::from_data(&data).unwrap();
        for _ in 0..(4194304 / 0x4000) {
            rom.clock(0x4000);
        }
        assert_eq!(rom.rtc().seconds, 1);
    }

    #[test]
    fn test_mbc5_nine_bit_bank() {
        let data = build_rom(0x19, 0x08, 0x02);
        let mut rom = Cartridge::from_data(&data).unwrap();

        rom.write(0x2000, 0x34);
        assert_eq!(rom.rom_bank(), 0x34);

        rom.write(0x3000, 0x01);
        assert_eq!(rom.rom_bank(), 0x134);
        assert_eq!(rom.read(0x4000), 0x34);
        assert_eq!(rom.read(0x4001), 0x01);

        // unlike MBC1/3, bank 0 is a legal selection
        rom.write(0x3000, 0x00);
        rom.write(0x2000, 0x00);
        assert_eq!(rom.rom_bank(), 0);
        assert_eq!(rom.read(0x4000), 0x00);
    }

    #[test]
    fn test_state_round_trip() {
        let data = build_rom(0x1b, 0x01, 0x03);
        let mut rom = Cartridge::from_data(&data).unwrap();
        rom.write(0x0000, 0x0a);
        rom.write(0x4000, 0x02);
        rom.write(0xa000, 0x99);

        let state = rom.state().unwrap();

        let mut restored = Cartridge::from_data(&data).unwrap();
        restored.set_state(&state).unwrap();
        assert_eq!(restored.ram_bank(), 2);
        assert!(restored.ram_enabled());
        assert_eq!(restored.read(0xa000), 0x99);
    }
}
