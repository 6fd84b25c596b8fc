use std::{
    ffi::OsString,
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use log::info;
use ndarray::{Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{FerError, Result};

/// Side length of every face image.
pub const SIDE: usize = 48;
/// Pixel count of one face image.
pub const PIXELS: usize = SIDE * SIDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    pub const COUNT: usize = 7;

    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn index(self) -> usize {
        match self {
            Emotion::Angry => 0,
            Emotion::Disgust => 1,
            Emotion::Fear => 2,
            Emotion::Happy => 3,
            Emotion::Sad => 4,
            Emotion::Surprise => 5,
            Emotion::Neutral => 6,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Angry => "Angry",
            Emotion::Disgust => "Disgust",
            Emotion::Fear => "Fear",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Neutral => "Neutral",
        }
    }
}

impl TryFrom<i64> for Emotion {
    type Error = i64;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(Emotion::from_index)
            .ok_or(value)
    }
}

/// Partition marker from the `Usage` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Usage {
    Training,
    PublicTest,
    PrivateTest,
    Other(String),
}

impl Usage {
    /// Only `PrivateTest` rows are held out; everything else trains.
    pub fn is_held_out(&self) -> bool {
        matches!(self, Usage::PrivateTest)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Usage::Training => "Training",
            Usage::PublicTest => "PublicTest",
            Usage::PrivateTest => "PrivateTest",
            Usage::Other(s) => s,
        }
    }
}

impl From<String> for Usage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Training" => Usage::Training,
            "PublicTest" => Usage::PublicTest,
            "PrivateTest" => Usage::PrivateTest,
            _ => Usage::Other(s),
        }
    }
}

impl From<Usage> for String {
    fn from(usage: Usage) -> Self {
        usage.as_str().to_string()
    }
}

/// One CSV row, kept verbatim next to the decoded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub pixels: String,
    pub emotion: Emotion,
    pub usage: Usage,
}

#[derive(Debug, Deserialize)]
struct SourceRow {
    emotion: i64,
    pixels: String,
    #[serde(rename = "Usage")]
    usage: String,
}

#[derive(Debug, Serialize)]
struct TabularRow<'a> {
    emotion: usize,
    pixels: &'a str,
    #[serde(rename = "Usage")]
    usage: &'a str,
}

/// Split a whitespace-delimited pixel string into exactly [`PIXELS`] intensities.
pub fn parse_pixels(pixels: &str, row: usize) -> Result<Vec<u8>> {
    let values = pixels
        .split_whitespace()
        .enumerate()
        .map(|(j, tok)| {
            // `u8::from_str` also takes a leading '+'.
            tok.bytes()
                .all(|b| b.is_ascii_digit())
                .then(|| tok.parse::<u8>().ok())
                .flatten()
                .ok_or_else(|| FerError::MalformedRow {
                    row,
                    reason: format!("pixel {j} ('{tok}') is not an intensity in 0..=255"),
                })
        })
        .collect::<Result<Vec<u8>>>()?;

    if values.len() != PIXELS {
        return Err(FerError::MalformedRow {
            row,
            reason: format!("expected {PIXELS} pixel values, found {}", values.len()),
        });
    }
    Ok(values)
}

/// Where the source CSV and its two caches live.
#[derive(Debug, Clone)]
pub struct DatasetPaths {
    pub source_csv: PathBuf,
    pub cache_csv: PathBuf,
    pub cache_bin: PathBuf,
}

impl DatasetPaths {
    /// `stem` is the dataset path without extension, e.g. `stims/fer2013/fer2013`.
    pub fn from_stem(stem: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut s: OsString = stem.as_os_str().to_owned();
            s.push(suffix);
            PathBuf::from(s)
        };
        Self {
            source_csv: with_suffix(".csv"),
            cache_csv: with_suffix("_ouput.csv"),
            cache_bin: with_suffix("_ouput.bin"),
        }
    }
}

/// All records plus their decoded `n × 48 × 48` images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub records: Vec<Record>,
    pub images: Array3<u8>,
}

impl Dataset {
    /// Load from the binary cache when present, otherwise parse the CSV and
    /// write both caches.
    pub fn load(paths: &DatasetPaths) -> Result<Self> {
        if paths.cache_bin.is_file() {
            info!("Processed data found, loading {}", paths.cache_bin.display());
            return Self::read_cache(&paths.cache_bin);
        }

        if !paths.source_csv.is_file() {
            return Err(FerError::MissingInput {
                path: paths.source_csv.clone(),
            });
        }

        info!("Converting pixel strings from {}", paths.source_csv.display());
        let dataset = Self::from_csv(&paths.source_csv)?;

        info!("Saving data to {}", paths.cache_csv.display());
        dataset.write_tabular(&paths.cache_csv)?;
        info!("Saving data to {}", paths.cache_bin.display());
        dataset.write_cache(&paths.cache_bin)?;

        Ok(dataset)
    }

    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        let mut flat = Vec::new();

        for (row, result) in reader.deserialize::<SourceRow>().enumerate() {
            let raw = result?;
            let emotion = Emotion::try_from(raw.emotion)
                .map_err(|value| FerError::InvalidLabel { row, value })?;
            flat.extend(parse_pixels(&raw.pixels, row)?);
            records.push(Record {
                pixels: raw.pixels,
                emotion,
                usage: Usage::from(raw.usage),
            });
        }

        Self::from_parts(records, flat)
    }

    pub(crate) fn from_parts(records: Vec<Record>, flat: Vec<u8>) -> Result<Self> {
        let n = records.len();
        let images = Array3::from_shape_vec((n, SIDE, SIDE), flat).map_err(|e| {
            FerError::MalformedRow {
                row: n,
                reason: format!("image buffer does not match {n} records: {e}"),
            }
        })?;
        Ok(Self { records, images })
    }

    pub fn read_cache(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let dataset: Dataset =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;

        let shape = dataset.images.shape();
        if shape[0] != dataset.records.len() || shape[1] != SIDE || shape[2] != SIDE {
            return Err(FerError::MalformedRow {
                row: 0,
                reason: format!(
                    "cached images have shape {shape:?} for {} records",
                    dataset.records.len()
                ),
            });
        }
        Ok(dataset)
    }

    pub fn write_cache(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        Ok(())
    }

    pub fn write_tabular(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(TabularRow {
                emotion: record.emotion.index(),
                pixels: &record.pixels,
                usage: record.usage.as_str(),
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn image(&self, index: usize) -> ArrayView2<'_, u8> {
        self.images.index_axis(Axis(0), index)
    }

    pub fn class_counts(&self) -> [usize; Emotion::COUNT] {
        let mut counts = [0; Emotion::COUNT];
        for record in &self.records {
            counts[record.emotion.index()] += 1;
        }
        counts
    }

    pub fn indices_of(&self, emotion: Emotion) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.emotion == emotion)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Faces whose class is encoded as a bright horizontal band, so every
    /// classifier can separate them.
    pub fn face_pixels(emotion: Emotion, variant: usize) -> Vec<u8> {
        let band = emotion.index() * 6..emotion.index() * 6 + 6;
        (0..PIXELS)
            .map(|p| {
                let jitter = ((p * 7 + variant * 13) % 11) as u8;
                if band.contains(&(p / SIDE)) {
                    200 + jitter
                } else {
                    10 + jitter
                }
            })
            .collect()
    }

    pub fn pixel_string(values: &[u8]) -> String {
        values
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `counts[c]` training rows and `held_out[c]` `PrivateTest` rows per class.
    pub fn dataset(counts: [usize; Emotion::COUNT], held_out: [usize; Emotion::COUNT]) -> Dataset {
        let mut records = Vec::new();
        let mut flat = Vec::new();
        for emotion in Emotion::ALL {
            let c = emotion.index();
            for v in 0..counts[c] + held_out[c] {
                let values = face_pixels(emotion, v);
                let usage = if v < held_out[c] {
                    Usage::PrivateTest
                } else if v % 2 == 0 {
                    Usage::Training
                } else {
                    Usage::PublicTest
                };
                records.push(Record {
                    pixels: pixel_string(&values),
                    emotion,
                    usage,
                });
                flat.extend(values);
            }
        }
        Dataset::from_parts(records, flat).expect("fixture shape")
    }

    pub fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("emotion-face-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    pub fn write_csv(path: &Path, dataset: &Dataset) {
        let mut out = String::from("emotion,pixels,Usage\n");
        for r in &dataset.records {
            out.push_str(&format!("{},{},{}\n", r.emotion.index(), r.pixels, r.usage.as_str()));
        }
        std::fs::write(path, out).expect("write csv");
    }
}
