// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application image plausibility checks.
//!
//! Before any CRC work, the head of the application's vector table gets a
//! cheap sanity pass: a bogus stack pointer or entry address means there
//! is no point hashing half a megabyte of flash, and means the jump must
//! never happen regardless of what the CRC says.

use abi::map;

/// The first two words of the application's vector table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ImageInfo {
    pub initial_sp: u32,
    pub entry: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageError {
    /// The image slots still hold the erased-flash value.
    Erased,
    /// Initial stack pointer outside valid RAM.
    StackPointerRange,
    /// Initial stack pointer not word-aligned.
    StackPointerAlign,
    /// Entry address outside the application flash region.
    EntryRange,
    /// Entry address missing the Thumb bit.
    EntryNotThumb,
}

/// Validates the vector-table head of a candidate application image.
pub fn check_plausibility(info: ImageInfo) -> Result<(), ImageError> {
    if info.initial_sp == 0xFFFF_FFFF || info.entry == 0xFFFF_FFFF {
        return Err(ImageError::Erased);
    }
    if info.initial_sp < map::RAM_START || info.initial_sp > map::RAM_END {
        return Err(ImageError::StackPointerRange);
    }
    if info.initial_sp & 0x3 != 0 {
        return Err(ImageError::StackPointerAlign);
    }
    if info.entry < map::APP_FLASH_START || info.entry > map::APP_FLASH_END {
        return Err(ImageError::EntryRange);
    }
    if info.entry & 0x1 == 0 {
        return Err(ImageError::EntryNotThumb);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good() -> ImageInfo {
        ImageInfo {
            initial_sp: map::RAM_END,
            entry: map::APP_FLASH_START | 1,
        }
    }

    #[test]
    fn valid_image_passes() {
        assert_eq!(check_plausibility(good()), Ok(()));
    }

    #[test]
    fn erased_image_is_rejected() {
        let mut info = good();
        info.initial_sp = 0xFFFF_FFFF;
        assert_eq!(check_plausibility(info), Err(ImageError::Erased));
        let mut info = good();
        info.entry = 0xFFFF_FFFF;
        assert_eq!(check_plausibility(info), Err(ImageError::Erased));
    }

    #[test]
    fn stack_pointer_must_be_in_ram() {
        let mut info = good();
        info.initial_sp = map::RAM_START - 4;
        assert_eq!(
            check_plausibility(info),
            Err(ImageError::StackPointerRange)
        );
        info.initial_sp = map::RAM_END + 4;
        assert_eq!(
            check_plausibility(info),
            Err(ImageError::StackPointerRange)
        );
    }

    #[test]
    fn stack_pointer_must_be_aligned() {
        let mut info = good();
        info.initial_sp = map::RAM_START + 2;
        assert_eq!(
            check_plausibility(info),
            Err(ImageError::StackPointerAlign)
        );
    }

    #[test]
    fn entry_must_be_thumb_in_app_region() {
        let mut info = good();
        info.entry = map::BOOT_FLASH_START | 1;
        assert_eq!(check_plausibility(info), Err(ImageError::EntryRange));

        let mut info = good();
        info.entry = map::APP_FLASH_START;
        assert_eq!(check_plausibility(info), Err(ImageError::EntryNotThumb));
    }
}
