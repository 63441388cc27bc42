//! Read-only view over a decrypted image.

use crate::constants::*;
use crate::image::{FigureId, TagImage};
use num_enum::TryFromPrimitive;

/// Games known to store data in the application area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, strum_macros::Display)]
#[repr(u32)]
pub enum AppId {
    #[strum(to_string = "No App Data")]
    None = 0,
    #[strum(to_string = "Animal Crossing: Happy Home Designer")]
    AnimalCrossingHappyHomeDesigner = 0x0014_F000,
    #[strum(to_string = "Chibi-Robo!: Zip-Lash")]
    ChibiRoboZipLash = 0x0015_2600,
    #[strum(to_string = "The Legend of Zelda: Link's Awakening")]
    LinksAwakening = 0x3B44_0400,
    #[strum(to_string = "Mario & Luigi: Paper Jam")]
    MarioLuigiPaperJam = 0x0013_2600,
    #[strum(to_string = "Super Smash Bros")]
    SmashBros = 0x1011_0E00,
    #[strum(to_string = "Super Smash Bros: Ultimate")]
    SmashBrosUltimate = 0x34F8_0200,
    #[strum(to_string = "Splatoon 2")]
    Splatoon2 = 0x1016_2B00,
    #[strum(to_string = "The Legend of Zelda: Twilight Princess HD")]
    TwilightPrincessHD = 0x1019_C800,
}

/// Plaintext image whose signatures have been checked, or which was built
/// locally and is about to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedImage {
    plain: TagImage,
}

impl DecryptedImage {
    pub(crate) fn new(plain: TagImage) -> Self {
        Self { plain }
    }

    pub fn as_image(&self) -> &TagImage {
        &self.plain
    }

    pub fn into_image(self) -> TagImage {
        self.plain
    }

    pub fn figure_id(&self) -> FigureId {
        self.plain.figure_id()
    }

    pub fn settings_flags(&self) -> u8 {
        self.plain.as_bytes()[SETTINGS_FLAGS]
    }

    pub fn has_user_data(&self) -> bool {
        self.settings_flags() & FLAG_USER_DATA != 0
    }

    pub fn has_app_data(&self) -> bool {
        self.settings_flags() & FLAG_APP_DATA != 0
    }

    pub fn country_code(&self) -> u8 {
        self.plain.as_bytes()[COUNTRY_CODE]
    }

    pub fn modified_counter(&self) -> u16 {
        let b = self.plain.field(MODIFIED_COUNTER);
        u16::from_be_bytes([b[0], b[1]])
    }

    /// Owner nickname; empty when the figure was never registered.
    pub fn nickname(&self) -> String {
        if self.modified_counter() == 0 {
            return String::new();
        }
        let units: Vec<u16> = self
            .plain
            .field(NICKNAME)
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units).trim_matches('\0').to_string()
    }

    pub fn app_id(&self) -> u32 {
        let b = self.plain.field(APP_ID);
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    /// `None` for ids this crate has no name for.
    pub fn known_app(&self) -> Option<AppId> {
        AppId::try_from(self.app_id()).ok()
    }

    pub fn app_data(&self) -> &[u8] {
        self.plain.field(APP_DATA)
    }
}
