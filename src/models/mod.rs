mod artifact;
mod bar;
mod profile;
mod symbol;
mod zone;

pub use artifact::{Artifact, ARTIFACT_SUFFIX};
pub use bar::{Bar, BarInterval};
pub use profile::{ChipProfile, Decay, DistributionPolicy, PriceBin, Resolution};
pub use symbol::{SymbolConfig, SymbolEntry};
pub use zone::{AccumulationSeries, BinStrength, ChipZones, Language, ZoneType};
