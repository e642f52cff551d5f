//! Helpers for the construction of machines used in testing
//! and benchmarking contexts.

use dotmatrix_common::error::Error;

use crate::gb::{GameBoy, GameBoyConfig};

#[derive(Default)]
pub struct TestOptions {
    pub skip_bootrom: Option<bool>,
    pub audio_sample_rate: Option<u32>,
    pub audio_buffer_samples: Option<u32>,
}

/// Builds a machine with an empty (zero filled) cartridge loaded,
/// ready to be clocked.
pub fn build_test(options: TestOptions) -> Box<GameBoy> {
    let config = GameBoyConfig {
        skip_bootrom: options.skip_bootrom.unwrap_or(true),
        audio_sample_rate: options.audio_sample_rate.unwrap_or(44100),
        audio_buffer_samples: options.audio_buffer_samples.unwrap_or(512),
    };
    let mut game_boy = Box::new(GameBoy::new(Some(config)));
    game_boy.load_rom_empty().unwrap();
    game_boy
}

/// Runs the provided ROM file for the requested number of cycles,
/// returning the resulting machine for inspection.
pub fn run_test(
    rom_path: &str,
    max_cycles: Option<u64>,
    options: TestOptions,
) -> Result<Box<GameBoy>, Error> {
    let max_cycles = max_cycles.unwrap_or(u64::MAX);
    let mut game_boy = build_test(options);
    game_boy.load_rom_file(rom_path)?;
    game_boy.reset();
    game_boy.clocks_cycles(max_cycles);
    Ok(game_boy)
}

#[cfg(test)]
mod tests {
    use super::{build_test, TestOptions};

    #[test]
    fn test_build_test_boot_state() {
        let game_boy = build_test(TestOptions::default());
        assert_eq!(game_boy.cpu_i().pc(), 0x0100);
        assert_eq!(game_boy.cpu_i().sp(), 0xfffe);
        assert_eq!(game_boy.cpu_i().af(), 0x01b0);
        assert_eq!(game_boy.cpu_i().bc(), 0x0013);
        assert_eq!(game_boy.cpu_i().de(), 0x00d8);
        assert_eq!(game_boy.cpu_i().hl(), 0x014d);
        assert!(!game_boy.cpu_i().ime());

        assert_eq!(game_boy.read_memory(0xff40), 0x91);
        assert_eq!(game_boy.read_memory(0xff47), 0xfc);
        assert_eq!(game_boy.read_memory(0xff26), 0xf1);
        assert_eq!(game_boy.read_memory(0xff00), 0xcf);
    }
}
