use chrono::NaiveDate;

pub const ARTIFACT_SUFFIX: &str = "chipzones_hybrid";

/// Rendered chart and table for one symbol and one run.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub symbol: String,
    pub run_date: NaiveDate,
    pub png: Vec<u8>,
    pub csv: Vec<u8>,
}

impl Artifact {
    /// `JM2601_chipzones_hybrid.png`
    pub fn latest_name(symbol: &str, extension: &str) -> String {
        format!("{}_{}.{}", symbol, ARTIFACT_SUFFIX, extension)
    }

    /// `JM2601_20251018_chipzones_hybrid.png`
    pub fn dated_name(symbol: &str, date: NaiveDate, extension: &str) -> String {
        format!(
            "{}_{}_{}.{}",
            symbol,
            date.format("%Y%m%d"),
            ARTIFACT_SUFFIX,
            extension
        )
    }

    pub fn files(&self) -> [(&'static str, &[u8]); 2] {
        [("png", &self.png), ("csv", &self.csv)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 18).unwrap();
        assert_eq!(Artifact::latest_name("JM2601", "png"), "JM2601_chipzones_hybrid.png");
        assert_eq!(
            Artifact::dated_name("JM2601", date, "csv"),
            "JM2601_20251018_chipzones_hybrid.csv"
        );
    }
}
