//! Exploratory figures: example faces, PCA mean faces and NMF mean components,
//! for the training set as a whole and for every emotion.

use std::path::PathBuf;

use image::GrayImage;
use log::{debug, info, warn};
use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    data::{Dataset, Emotion, PIXELS},
    decomposition::{Nmf, NmfConfig, Pca},
    error::{FerError, Result},
    report::{tile_from_pixels, tile_from_values, ImageGrid, Reporter},
    split::Partition,
};

/// A titled set of dataset rows fitted as one unit.
#[derive(Debug, Clone)]
pub struct Group {
    pub title: String,
    pub rows: Vec<usize>,
}

pub struct Analyzer<'a> {
    dataset: &'a Dataset,
    groups: Vec<Group>,
    n_components: usize,
    seed: u64,
}

impl<'a> Analyzer<'a> {
    /// "Overall" is the training partition; the per-emotion groups are taken
    /// from the whole dataset.
    pub fn new(dataset: &'a Dataset, train: &Partition, n_components: usize, seed: u64) -> Self {
        let mut groups = vec![Group {
            title: "Overall".to_string(),
            rows: train.rows.clone(),
        }];
        groups.extend(Emotion::ALL.iter().map(|&emotion| Group {
            title: emotion.name().to_string(),
            rows: dataset.indices_of(emotion),
        }));
        Self {
            dataset,
            groups,
            n_components,
            seed,
        }
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    fn matrix(&self, group: &Group) -> Result<Array2<f64>> {
        self.dataset
            .images
            .select(Axis(0), &group.rows)
            .mapv(f64::from)
            .into_shape_with_order((group.rows.len(), PIXELS))
            .map_err(|e| FerError::InvalidConfig(format!("{}: {e}", group.title)))
    }

    fn log_titles(&self, file: &str) {
        let titles: Vec<&str> = self.groups().iter().map(|g| g.title.as_str()).collect();
        info!("{file}: {}", titles.join(" | "));
    }

    /// One randomly chosen face per emotion.
    pub fn example_images(&self, reporter: &Reporter) -> Result<PathBuf> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut grid = ImageGrid::new(Emotion::COUNT);
        for group in &self.groups[1..] {
            if group.rows.is_empty() {
                warn!("No {} faces for the example grid", group.title);
                grid.push(None);
                continue;
            }
            let row = group.rows[rng.random_range(0..group.rows.len())];
            grid.push(Some(tile_from_pixels(self.dataset.image(row))?));
        }
        reporter.save_grid("example_imgs.png", &grid)
    }

    /// Mean face of every group, as fitted by a whitened PCA.
    pub fn pca_means(&self, reporter: &Reporter) -> Result<PathBuf> {
        let mut grid = ImageGrid::new(self.groups.len());
        for group in &self.groups {
            grid.push(self.pca_tile(group)?);
        }
        self.log_titles("pca_images.png");
        reporter.save_grid("pca_images.png", &grid)
    }

    fn pca_tile(&self, group: &Group) -> Result<Option<GrayImage>> {
        if group.rows.is_empty() {
            warn!("Skipping PCA for {}: no rows", group.title);
            return Ok(None);
        }
        let x = self.matrix(group)?;
        let pca = Pca::fit(x.view(), self.n_components, self.seed)?;
        let ratio: f64 = pca.explained_variance_ratio().sum();
        info!(
            "PCA {}: {} components explain {:.1}% of variance",
            group.title,
            pca.components.nrows(),
            ratio * 100.0
        );
        let whitened = pca.transform(x.view());
        let spread = whitened.mapv(|v| v * v).mean().unwrap_or(0.0).sqrt();
        debug!("PCA {}: whitened projection RMS {spread:.3}", group.title);
        tile_from_values(pca.mean.view()).map(Some)
    }

    fn nmf_tile(&self, group: &Group, n_components: usize) -> Result<Option<GrayImage>> {
        if group.rows.is_empty() {
            warn!("Skipping NMF for {}: no rows", group.title);
            return Ok(None);
        }
        let nmf = Nmf::fit(
            self.matrix(group)?.view(),
            &NmfConfig::new(n_components, self.seed),
        )?;
        info!(
            "NMF {} (k={n_components}): reconstruction error {:.2} after {} iterations",
            group.title, nmf.reconstruction_error, nmf.n_iter
        );
        tile_from_values(nmf.mean_component().view()).map(Some)
    }

    /// Mean NMF component of every group.
    pub fn nmf_means(&self, reporter: &Reporter) -> Result<PathBuf> {
        let mut grid = ImageGrid::new(self.groups.len());
        for group in &self.groups {
            grid.push(self.nmf_tile(group, self.n_components)?);
        }
        self.log_titles("nmf_images.png");
        reporter.save_grid("nmf_images.png", &grid)
    }

    /// One row of mean NMF components per entry of `counts`.
    pub fn nmf_sweep(&self, counts: &[usize], reporter: &Reporter) -> Result<PathBuf> {
        info!("Running NMF component comparisons for {counts:?}");
        let mut grid = ImageGrid::new(self.groups.len());
        for &k in counts {
            for group in &self.groups {
                grid.push(self.nmf_tile(group, k)?);
            }
        }
        self.log_titles("nmf_images_comparison.png");
        reporter.save_grid("nmf_images_comparison.png", &grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{fixtures, SIDE};
    use crate::split::Split;

    #[test]
    fn groups_cover_train_and_every_emotion() {
        let mut counts = [3; Emotion::COUNT];
        counts[Emotion::Disgust.index()] = 0;
        let ds = fixtures::dataset(counts, [1; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let analyzer = Analyzer::new(&ds, &split.train, 2, 99);

        let groups = analyzer.groups();
        assert_eq!(groups.len(), 1 + Emotion::COUNT);
        assert_eq!(groups[0].rows, split.train.rows);
        // Per-emotion groups include held-out rows.
        assert_eq!(groups[1 + Emotion::Angry.index()].rows.len(), 4);
        assert_eq!(groups[1 + Emotion::Disgust.index()].rows.len(), 1);
    }

    #[test]
    fn writes_all_figures() {
        let dir = fixtures::temp_dir("analysis");
        let ds = fixtures::dataset([3; Emotion::COUNT], [1; Emotion::COUNT]);
        let split = Split::new(&ds).unwrap();
        let reporter = Reporter::new(&dir).unwrap();
        let analyzer = Analyzer::new(&ds, &split.train, 2, 99);

        let examples = analyzer.example_images(&reporter).unwrap();
        let pca = analyzer.pca_means(&reporter).unwrap();
        let nmf = analyzer.nmf_means(&reporter).unwrap();
        let sweep = analyzer.nmf_sweep(&[1, 2], &reporter).unwrap();

        let examples = image::open(examples).unwrap();
        let pca = image::open(pca).unwrap();
        let sweep = image::open(sweep).unwrap();
        assert!(nmf.is_file());
        assert!(examples.width() < pca.width());
        assert_eq!(pca.width(), sweep.width());
        assert!(sweep.height() > pca.height());
        assert!(pca.height() >= 2 * SIDE as u32);
    }
}
