use std::{fmt, str::FromStr};

use time::OffsetDateTime;

use super::DecodeError;

/// Fuel categories published in the half-hourly generation mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FuelType {
    Biomass,
    Coal,
    Gas,
    Hydro,
    Imports,
    Nuclear,
    Other,
    Solar,
    Storage,
    Wind,
    WindEmbedded,
}

impl FuelType {
    pub const ALL: [FuelType; 11] = [
        FuelType::Biomass,
        FuelType::Coal,
        FuelType::Gas,
        FuelType::Hydro,
        FuelType::Imports,
        FuelType::Nuclear,
        FuelType::Other,
        FuelType::Solar,
        FuelType::Storage,
        FuelType::Wind,
        FuelType::WindEmbedded,
    ];

    /// Stable identifier used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            FuelType::Biomass => "biomass",
            FuelType::Coal => "coal",
            FuelType::Gas => "gas",
            FuelType::Hydro => "hydro",
            FuelType::Imports => "imports",
            FuelType::Nuclear => "nuclear",
            FuelType::Other => "other",
            FuelType::Solar => "solar",
            FuelType::Storage => "storage",
            FuelType::Wind => "wind",
            FuelType::WindEmbedded => "wind_embedded",
        }
    }

    /// Column label used by the upstream wide-format dataset (`GAS`, `WIND_EMB`, ...).
    pub fn source_label(&self) -> &'static str {
        match self {
            FuelType::Biomass => "BIOMASS",
            FuelType::Coal => "COAL",
            FuelType::Gas => "GAS",
            FuelType::Hydro => "HYDRO",
            FuelType::Imports => "IMPORTS",
            FuelType::Nuclear => "NUCLEAR",
            FuelType::Other => "OTHER",
            FuelType::Solar => "SOLAR",
            FuelType::Storage => "STORAGE",
            FuelType::Wind => "WIND",
            FuelType::WindEmbedded => "WIND_EMB",
        }
    }
}

impl fmt::Display for FuelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FuelType {
    type Err = DecodeError;

    /// Accepts storage identifiers and upstream labels, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        let fuel = match normalized.as_str() {
            "biomass" => FuelType::Biomass,
            "coal" => FuelType::Coal,
            "gas" | "ccgt" | "ocgt" => FuelType::Gas,
            "hydro" => FuelType::Hydro,
            "imports" => FuelType::Imports,
            "nuclear" => FuelType::Nuclear,
            "other" => FuelType::Other,
            "solar" => FuelType::Solar,
            "storage" => FuelType::Storage,
            "wind" => FuelType::Wind,
            "wind_emb" | "wind_embedded" | "embedded_wind" => FuelType::WindEmbedded,
            _ => return Err(DecodeError::UnknownFuelType(s.to_string())),
        };
        Ok(fuel)
    }
}

/// One half-hourly observation for one fuel type.
///
/// The natural key is `(ts, fuel_type)`; `record_id` is the identifier the
/// upstream source assigned to the row the observation came from.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GenerationRecord {
    pub ts: OffsetDateTime,
    pub fuel_type: FuelType,
    pub generation_mw: f64,
    pub mix_percentage: f64,
    pub ingestion_version: i64,
    pub record_id: Option<i64>,
    pub quality_suspect: bool,
}

impl GenerationRecord {
    pub fn key(&self) -> (OffsetDateTime, FuelType) {
        (self.ts, self.fuel_type)
    }
}

/// Storage representation of the `generation` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GenerationRow {
    pub timestamp: i64,
    pub fuel_type: String,
    pub generation_mw: f64,
    pub mix_percentage: f64,
    pub ingestion_version: i64,
    pub record_id: Option<i64>,
    pub quality_suspect: bool,
}

impl TryFrom<GenerationRow> for GenerationRecord {
    type Error = DecodeError;

    fn try_from(row: GenerationRow) -> Result<Self, Self::Error> {
        Ok(GenerationRecord {
            ts: OffsetDateTime::from_unix_timestamp(row.timestamp)
                .map_err(|_| DecodeError::Timestamp(row.timestamp))?,
            fuel_type: row.fuel_type.parse()?,
            generation_mw: row.generation_mw,
            mix_percentage: row.mix_percentage,
            ingestion_version: row.ingestion_version,
            record_id: row.record_id,
            quality_suspect: row.quality_suspect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuel_type_parses_upstream_labels_and_storage_ids() {
        for fuel in FuelType::ALL {
            assert_eq!(fuel.source_label().parse::<FuelType>().unwrap(), fuel);
            assert_eq!(fuel.as_str().parse::<FuelType>().unwrap(), fuel);
        }
        assert_eq!("Wind-Embedded".parse::<FuelType>().unwrap(), FuelType::WindEmbedded);
    }

    #[test]
    fn unknown_fuel_type_is_an_error() {
        assert!(matches!(
            "tidal".parse::<FuelType>(),
            Err(DecodeError::UnknownFuelType(label)) if label == "tidal"
        ));
    }
}
