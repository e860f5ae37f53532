pub const SCATA_DISPLAY_VERSION: &str = env!("SCATA_DISPLAY_VERSION");
pub const SCATA_BUILD_N: &str = env!("SCATA_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "SCATA {}\nBuild {}\nAmplicon filtering, detagging and clustering engine",
        SCATA_DISPLAY_VERSION, SCATA_BUILD_N
    )
}
