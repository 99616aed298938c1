//! CSV-backed growth factor loading
//!
//! One file holds every factor:
//!
//! ```text
//! category,year,kind,value,from,to
//! earnings,2023,multiplicative,1.041,,
//! benefits,2023,additive,120.0,,
//! demographics,2023,shift,0.9,16-24,16-24
//! demographics,2023,shift,0.1,16-24,25-64
//! ```

use super::provider::StaticFactorProvider;
use super::table::GrowthFactor;
use crate::error::{ProjectionError, Result};
use csv::Reader;
use std::collections::BTreeMap;
use std::path::Path;

/// Default file name inside a factors directory
pub const DEFAULT_FACTORS_FILE: &str = "growth_factors.csv";

/// Raw CSV row matching growth_factors.csv columns
#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    category: String,
    year: i32,
    kind: String,
    value: f64,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
}

type Transitions = BTreeMap<String, BTreeMap<String, f64>>;

/// Load all growth factors from a CSV file
pub fn load_growth_factors<P: AsRef<Path>>(path: P) -> Result<StaticFactorProvider> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("csv")
        .to_string();
    let reader = Reader::from_path(path)?;
    read_factors(&name, reader)
}

/// Load growth factors from any reader
pub fn load_growth_factors_from_reader<R: std::io::Read>(name: &str, reader: R) -> Result<StaticFactorProvider> {
    read_factors(name, Reader::from_reader(reader))
}

fn read_factors<R: std::io::Read>(name: &str, mut reader: Reader<R>) -> Result<StaticFactorProvider> {
    let mut provider = StaticFactorProvider::new(name);
    let mut shifts: BTreeMap<(String, i32), Transitions> = BTreeMap::new();

    for result in reader.deserialize() {
        let row: CsvRow = result?;
        let factor = match row.kind.trim().to_ascii_lowercase().as_str() {
            "multiplicative" => GrowthFactor::Multiplicative { factor: row.value },
            "additive" => GrowthFactor::Additive { delta: row.value },
            "shift" => {
                let from = non_empty(row.from, "from", &row.category, row.year)?;
                let to = non_empty(row.to, "to", &row.category, row.year)?;
                let transitions = shifts.entry((row.category.clone(), row.year)).or_default();
                let previous = transitions.entry(from.clone()).or_default().insert(to.clone(), row.value);
                if previous.is_some() {
                    return Err(ProjectionError::config(format!(
                        "shift '{}' in {} repeats transition {} -> {}",
                        row.category, row.year, from, to
                    )));
                }
                continue;
            }
            other => {
                return Err(ProjectionError::config(format!(
                    "unknown growth factor kind '{}' for '{}' in {}",
                    other, row.category, row.year
                )))
            }
        };

        if provider.get(&row.category, row.year).is_some() {
            return Err(duplicate(&row.category, row.year));
        }
        factor.validate(&row.category, row.year)?;
        provider.insert(&row.category, row.year, factor);
    }

    for ((category, year), transitions) in shifts {
        if provider.get(&category, year).is_some() {
            return Err(duplicate(&category, year));
        }
        let factor = GrowthFactor::CategoricalShift { transitions };
        factor.validate(&category, year)?;
        provider.insert(&category, year, factor);
    }

    Ok(provider)
}

fn non_empty(value: Option<String>, column: &str, category: &str, year: i32) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ProjectionError::config(format!(
                "shift row for '{}' in {} has no '{}' category",
                category, year, column
            ))
        })
}

fn duplicate(category: &str, year: i32) -> ProjectionError {
    ProjectionError::config(format!(
        "growth factor for '{}' in {} defined more than once",
        category, year
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::growth::GrowthFactorProvider;
    use std::io::Write;

    const FACTORS: &str = "category,year,kind,value,from,to\n\
        earnings,2023,multiplicative,1.041,,\n\
        benefits,2023,additive,120.0,,\n\
        demographics,2023,shift,0.9,16-24,16-24\n\
        demographics,2023,shift,0.1,16-24,25-64\n";

    #[test]
    fn test_load_mixed_factor_kinds() {
        let provider = load_growth_factors_from_reader("test", FACTORS.as_bytes()).unwrap();
        let table = provider.factors_for(2023).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.require("benefits").unwrap(), &GrowthFactor::Additive { delta: 120.0 });
        match table.require("demographics").unwrap() {
            GrowthFactor::CategoricalShift { transitions } => {
                assert_eq!(transitions["16-24"]["25-64"], 0.1);
            }
            other => panic!("unexpected factor {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let data = "category,year,kind,value,from,to\nearnings,2023,exponential,1.0,,\n";
        let err = load_growth_factors_from_reader("bad", data.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("exponential"));
    }

    #[test]
    fn test_incomplete_shift_rejected() {
        let data = "category,year,kind,value,from,to\ndemographics,2023,shift,0.5,a,b\n";
        assert!(load_growth_factors_from_reader("bad", data.as_bytes()).is_err());
    }

    #[test]
    fn test_load_from_file_uses_stem_as_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_FACTORS_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(FACTORS.as_bytes()).unwrap();

        let provider = load_growth_factors(&path).unwrap();
        assert_eq!(provider.name(), "growth_factors");
    }
}
