//! Save state machinery, component serialization and the binary
//! envelope used for full machine snapshots.

use dotmatrix_common::{
    data::{read_into, read_u32, read_u8, read_vec, write_bytes, write_u32, write_u8},
    error::Error,
};
use std::io::Cursor;

use crate::gb::GameBoy;

/// Magic string present at the start of every save state file.
pub const SAVE_STATE_MAGIC: &[u8; 7] = b"GBSTATE";

/// Current version of the save state format.
pub const SAVE_STATE_VERSION: u8 = 1;

/// Trait implemented by every component whose state can be dumped
/// into (and restored from) a binary blob.
pub trait StateComponent {
    fn state(&self) -> Result<Vec<u8>, Error>;
    fn set_state(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// Serializes the complete machine state into the save state
/// envelope, components are written in a fixed order with each
/// blob prefixed by its size.
pub fn save_state(gb: &GameBoy) -> Result<Vec<u8>, Error> {
    let mut cursor = Cursor::new(vec![]);
    write_bytes(&mut cursor, SAVE_STATE_MAGIC)?;
    write_u8(&mut cursor, SAVE_STATE_VERSION)?;
    write_component(&mut cursor, gb.cpu_i())?;
    write_component(&mut cursor, gb.mmu_i())?;
    write_component(&mut cursor, gb.rom_i())?;
    write_component(&mut cursor, gb.ppu_i())?;
    write_component(&mut cursor, gb.apu_i())?;
    write_component(&mut cursor, gb.timer_i())?;
    Ok(cursor.into_inner())
}

/// Restores a complete machine state from the provided buffer,
/// the magic and version are validated before any component state
/// is touched so that a refused load leaves the machine unchanged.
pub fn load_state(gb: &mut GameBoy, data: &[u8]) -> Result<(), Error> {
    let mut cursor = Cursor::new(data);

    let mut magic = [0u8; 7];
    read_into(&mut cursor, &mut magic)?;
    if &magic != SAVE_STATE_MAGIC {
        return Err(Error::InvalidMagic);
    }
    if read_u8(&mut cursor)? != SAVE_STATE_VERSION {
        return Err(Error::InvalidVersion);
    }

    read_component(&mut cursor, gb.cpu())?;
    read_component(&mut cursor, gb.mmu())?;
    read_component(&mut cursor, gb.mmu().rom())?;
    read_component(&mut cursor, gb.ppu())?;
    read_component(&mut cursor, gb.mmu().apu())?;
    read_component(&mut cursor, gb.mmu().timer())?;
    Ok(())
}

fn write_component(
    cursor: &mut Cursor<Vec<u8>>,
    component: &dyn StateComponent,
) -> Result<(), Error> {
    let data = component.state()?;
    write_u32(cursor, data.len() as u32)?;
    write_bytes(cursor, &data)?;
    Ok(())
}

fn read_component(
    cursor: &mut Cursor<&[u8]>,
    component: &mut dyn StateComponent,
) -> Result<(), Error> {
    let size = read_u32(cursor)? as usize;
    let data = read_vec(cursor, size)?;
    component.set_state(&data)
}
