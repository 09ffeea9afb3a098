use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{imageops, GrayImage};
use log::{debug, error, info};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::VtopError;

/// Symbols the portal renders. I, O, 0 and 1 never appear.
pub const ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const GLYPH_COUNT: usize = 6;
pub const CELL_WIDTH: u32 = 24;
pub const CELL_HEIGHT: u32 = 22;
pub const CELL_PIXELS: usize = (CELL_WIDTH * CELL_HEIGHT) as usize;

static CLASSIFIER: OnceCell<ClassifierState> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SolveError {
    #[error("captcha payload is not valid base64: {0}")]
    Decode(String),
    #[error("invalid captcha image: {0}")]
    InvalidImage(String),
    #[error("captcha solving produced unexpected output: {0:?}")]
    Malformed(String),
    #[error("captcha classifier unavailable: {0}")]
    Unavailable(String),
}

impl From<SolveError> for VtopError {
    fn from(err: SolveError) -> Self {
        VtopError::Captcha(err.to_string())
    }
}

/// Raw classifier resource as stored on disk: one weight row per cell pixel,
/// one column (and one bias) per alphabet symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierParameters {
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
}

/// Pixel bounds of one glyph cell, half-open on `x2`/`y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

/// Cell geometry of the portal's CAPTCHA renderer. Odd cells sit five pixels
/// lower than even ones.
pub fn cell_rect(index: usize) -> CellRect {
    let i = index as u32;
    CellRect {
        x1: (i + 1) * 25 + 2,
        y1: 7 + 5 * (i % 2) + 1,
        x2: (i + 2) * 25 + 1,
        y2: 35 - 5 * ((i + 1) % 2),
    }
}

/// Slices the image into the fixed glyph cells.
pub fn partition(image: &GrayImage) -> Result<Vec<GrayImage>, SolveError> {
    (0..GLYPH_COUNT)
        .map(|index| {
            let rect = cell_rect(index);
            if rect.x2 > image.width() || rect.y2 > image.height() {
                return Err(SolveError::InvalidImage(format!(
                    "{}x{} image cannot hold glyph cell {}",
                    image.width(),
                    image.height(),
                    index
                )));
            }
            let cell = imageops::crop_imm(
                image,
                rect.x1,
                rect.y1,
                rect.x2 - rect.x1,
                rect.y2 - rect.y1,
            )
            .to_image();
            Ok(cell)
        })
        .collect()
}

/// Thresholds a cell against its own mean intensity. Dark pixels (at or
/// below the mean) become 1.
pub fn binarize(cell: &GrayImage) -> Result<Vec<u8>, SolveError> {
    let pixels = cell.as_raw();
    if pixels.is_empty() {
        return Err(SolveError::InvalidImage("empty glyph cell".to_string()));
    }
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / pixels.len() as f64;
    Ok(pixels
        .iter()
        .map(|&p| if p as f64 > mean { 0 } else { 1 })
        .collect())
}

pub fn decode_image(captcha_base64: &str) -> Result<GrayImage, SolveError> {
    let bytes = STANDARD
        .decode(captcha_base64.trim())
        .map_err(|e| SolveError::Decode(e.to_string()))?;
    let image =
        image::load_from_memory(&bytes).map_err(|e| SolveError::InvalidImage(e.to_string()))?;
    Ok(image.to_luma8())
}

/// Single-layer glyph classifier over binarized 24x22 cells.
#[derive(Debug, Clone)]
pub struct GlyphClassifier {
    // Row-major CELL_PIXELS x ALPHABET.len().
    weights: Vec<f64>,
    biases: Vec<f64>,
}

impl GlyphClassifier {
    pub fn new(parameters: ClassifierParameters) -> Result<Self, SolveError> {
        let symbols = ALPHABET.len();
        if parameters.biases.len() != symbols {
            return Err(SolveError::Unavailable(format!(
                "expected {} biases, found {}",
                symbols,
                parameters.biases.len()
            )));
        }
        if parameters.weights.len() != CELL_PIXELS {
            return Err(SolveError::Unavailable(format!(
                "expected {} weight rows, found {}",
                CELL_PIXELS,
                parameters.weights.len()
            )));
        }
        if let Some((row, bad)) = parameters
            .weights
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != symbols)
        {
            return Err(SolveError::Unavailable(format!(
                "weight row {} has {} columns, expected {}",
                row,
                bad.len(),
                symbols
            )));
        }

        Ok(Self {
            weights: parameters.weights.into_iter().flatten().collect(),
            biases: parameters.biases,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, SolveError> {
        let parameters: ClassifierParameters = serde_json::from_str(json)
            .map_err(|e| SolveError::Unavailable(format!("invalid parameter file: {}", e)))?;
        Self::new(parameters)
    }

    pub fn load(path: &Path) -> Result<Self, SolveError> {
        let json = fs::read_to_string(path).map_err(|e| {
            SolveError::Unavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Maps one binarized cell to the most likely alphabet symbol.
    pub fn classify(&self, bitmap: &[u8]) -> Result<char, SolveError> {
        if bitmap.len() != CELL_PIXELS {
            return Err(SolveError::InvalidImage(format!(
                "glyph bitmap has {} pixels, expected {}",
                bitmap.len(),
                CELL_PIXELS
            )));
        }

        let symbols = self.biases.len();
        let mut scores = self.biases.clone();
        for (row, &bit) in self.weights.chunks_exact(symbols).zip(bitmap) {
            if bit == 0 {
                continue;
            }
            for (score, weight) in scores.iter_mut().zip(row) {
                *score += weight;
            }
        }

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (index, score) in scores.iter().map(|s| s.exp()).enumerate() {
            if score > best_score {
                best = index;
                best_score = score;
            }
        }

        ALPHABET
            .chars()
            .nth(best)
            .ok_or_else(|| SolveError::Malformed(format!("class index {}", best)))
    }
}

/// Anything that can turn a base64 CAPTCHA payload into its text.
pub trait CaptchaSolver: Send + Sync {
    fn solve(&self, captcha_base64: &str) -> Result<String, SolveError>;
}

impl CaptchaSolver for GlyphClassifier {
    fn solve(&self, captcha_base64: &str) -> Result<String, SolveError> {
        let image = decode_image(captcha_base64)?;
        let cells = partition(&image)?;

        let mut text = String::with_capacity(GLYPH_COUNT);
        for cell in &cells {
            let bitmap = binarize(cell)?;
            text.push(self.classify(&bitmap)?);
        }

        if text.chars().count() != GLYPH_COUNT || !text.chars().all(|c| ALPHABET.contains(c)) {
            return Err(SolveError::Malformed(text));
        }
        debug!("[Captcha Solver] Solved: {}", text);
        Ok(text)
    }
}

/// Outcome of the one-time classifier load.
#[derive(Debug)]
pub enum ClassifierState {
    Loaded(Arc<GlyphClassifier>),
    Failed(String),
}

/// Loads the process-wide classifier parameters. Only the first call reads
/// the file; later calls return the recorded state. A failed load is logged
/// and leaves every later solve failing with `Unavailable`.
pub fn init_classifier(path: &Path) -> &'static ClassifierState {
    CLASSIFIER.get_or_init(|| match GlyphClassifier::load(path) {
        Ok(classifier) => {
            info!("Captcha classifier loaded from {}", path.display());
            ClassifierState::Loaded(Arc::new(classifier))
        }
        Err(e) => {
            error!("Failed to load captcha classifier: {}", e);
            ClassifierState::Failed(e.to_string())
        }
    })
}

/// `None` until `init_classifier` has run.
pub fn classifier_state() -> Option<&'static ClassifierState> {
    CLASSIFIER.get()
}

pub fn shared_classifier() -> Result<Arc<GlyphClassifier>, SolveError> {
    match CLASSIFIER.get() {
        Some(ClassifierState::Loaded(classifier)) => Ok(Arc::clone(classifier)),
        Some(ClassifierState::Failed(reason)) => Err(SolveError::Unavailable(reason.clone())),
        None => Err(SolveError::Unavailable(
            "classifier parameters not loaded".to_string(),
        )),
    }
}

/// Solver backed by the process-wide parameters from `init_classifier`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedClassifier;

impl CaptchaSolver for SharedClassifier {
    fn solve(&self, captcha_base64: &str) -> Result<String, SolveError> {
        shared_classifier()?.solve(captcha_base64)
    }
}

/// Runs the solver on the rayon pool so the async runtime keeps driving I/O.
pub async fn solve_off_thread(
    solver: Arc<dyn CaptchaSolver>,
    captcha_base64: String,
) -> Result<String, SolveError> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    rayon::spawn(move || {
        let start_time = Instant::now();
        let result = solver.solve(&captcha_base64);
        info!("[TIMING] captcha solve took {:.2?}", start_time.elapsed());
        tx.send(result).ok();
    });
    rx.await
        .map_err(|_| SolveError::Unavailable("solver worker exited without a result".to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn symbol_index(symbol: char) -> usize {
        ALPHABET.chars().position(|c| c == symbol).unwrap()
    }

    // Glyph k lights every cell pixel whose row-major index is k mod 32.
    fn template_parameters() -> ClassifierParameters {
        let symbols = ALPHABET.len();
        let weights = (0..CELL_PIXELS)
            .map(|pixel| {
                (0..symbols)
                    .map(|symbol| if pixel % symbols == symbol { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        ClassifierParameters {
            weights,
            biases: vec![0.0; symbols],
        }
    }

    fn render(text: &str) -> GrayImage {
        let mut image = GrayImage::from_pixel(200, 40, Luma([255]));
        for (index, symbol) in text.chars().enumerate() {
            let rect = cell_rect(index);
            let k = symbol_index(symbol);
            for pixel in (0..CELL_PIXELS).filter(|p| p % ALPHABET.len() == k) {
                let x = rect.x1 + (pixel as u32 % CELL_WIDTH);
                let y = rect.y1 + (pixel as u32 / CELL_WIDTH);
                image.put_pixel(x, y, Luma([0]));
            }
        }
        image
    }

    fn encode_as(image: GrayImage, format: ImageFormat) -> String {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(image)
            .write_to(&mut Cursor::new(&mut bytes), format)
            .unwrap();
        STANDARD.encode(bytes)
    }

    fn encode(image: GrayImage) -> String {
        encode_as(image, ImageFormat::Png)
    }

    #[test]
    fn cells_have_fixed_geometry() {
        assert_eq!(
            cell_rect(0),
            CellRect {
                x1: 27,
                y1: 8,
                x2: 51,
                y2: 30
            }
        );
        assert_eq!(
            cell_rect(1),
            CellRect {
                x1: 52,
                y1: 13,
                x2: 76,
                y2: 35
            }
        );
        for index in 0..GLYPH_COUNT {
            let rect = cell_rect(index);
            assert_eq!(rect.x2 - rect.x1, CELL_WIDTH);
            assert_eq!(rect.y2 - rect.y1, CELL_HEIGHT);
        }
        assert_eq!(cell_rect(5).x2, 176);
    }

    #[test]
    fn partition_rejects_small_images() {
        let image = GrayImage::new(150, 40);
        assert!(matches!(partition(&image), Err(SolveError::InvalidImage(_))));
        let image = GrayImage::new(200, 30);
        assert!(matches!(partition(&image), Err(SolveError::InvalidImage(_))));

        let cells = partition(&GrayImage::new(176, 35)).unwrap();
        assert_eq!(cells.len(), GLYPH_COUNT);
    }

    #[test]
    fn jpeg_payloads_decode_into_cells() {
        let captcha = encode_as(render("XJ4PQ7"), ImageFormat::Jpeg);
        let image = decode_image(&captcha).unwrap();
        assert_eq!(image.dimensions(), (200, 40));

        let cells = partition(&image).unwrap();
        assert_eq!(cells.len(), GLYPH_COUNT);
        for cell in &cells {
            assert_eq!(cell.dimensions(), (CELL_WIDTH, CELL_HEIGHT));
            assert_eq!(binarize(cell).unwrap().len(), CELL_PIXELS);
        }
    }

    #[test]
    fn binarize_uses_the_cell_mean() {
        let cell = GrayImage::from_raw(2, 2, vec![10, 200, 90, 100]).unwrap();
        // mean = 100
        assert_eq!(binarize(&cell).unwrap(), vec![1, 0, 1, 1]);

        let uniform = GrayImage::from_pixel(3, 3, Luma([128]));
        assert_eq!(binarize(&uniform).unwrap(), vec![1; 9]);

        let empty = GrayImage::new(0, 0);
        assert!(matches!(binarize(&empty), Err(SolveError::InvalidImage(_))));
    }

    #[test]
    fn rejects_misshapen_parameters() {
        let mut parameters = template_parameters();
        parameters.biases.push(0.0);
        assert!(GlyphClassifier::new(parameters).is_err());

        let mut parameters = template_parameters();
        parameters.weights.pop();
        assert!(GlyphClassifier::new(parameters).is_err());

        let mut parameters = template_parameters();
        parameters.weights[17].pop();
        assert!(GlyphClassifier::new(parameters).is_err());

        assert!(GlyphClassifier::from_json("{\"weights\": []}").is_err());
        assert!(GlyphClassifier::load(Path::new("/nonexistent/weights.json")).is_err());
    }

    #[test]
    fn classifies_template_glyphs() {
        let classifier = GlyphClassifier::new(template_parameters()).unwrap();
        let captcha = encode(render("XJ4PQ7"));
        assert_eq!(classifier.solve(&captcha).unwrap(), "XJ4PQ7");
    }

    #[test]
    fn solving_is_deterministic_and_stays_in_alphabet() {
        let classifier = GlyphClassifier::new(template_parameters()).unwrap();
        let mut noisy = render("AB23ZK");
        for (x, y, pixel) in noisy.enumerate_pixels_mut() {
            if (x * 7 + y * 13) % 11 == 0 {
                *pixel = Luma([((x * y) % 256) as u8]);
            }
        }
        let captcha = encode(noisy);
        let first = classifier.solve(&captcha).unwrap();
        let second = classifier.solve(&captcha).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), GLYPH_COUNT);
        assert!(first.chars().all(|c| ALPHABET.contains(c)));
    }

    #[test]
    fn bad_payloads_fail_to_solve() {
        let classifier = GlyphClassifier::new(template_parameters()).unwrap();
        assert!(matches!(
            classifier.solve("@@not base64@@"),
            Err(SolveError::Decode(_))
        ));
        assert!(matches!(
            classifier.solve(&STANDARD.encode(b"not an image")),
            Err(SolveError::InvalidImage(_))
        ));
        assert!(matches!(
            classifier.solve(&encode(GrayImage::new(100, 20))),
            Err(SolveError::InvalidImage(_))
        ));
    }

    #[tokio::test]
    async fn solves_on_the_worker_pool() {
        let classifier: Arc<dyn CaptchaSolver> =
            Arc::new(GlyphClassifier::new(template_parameters()).unwrap());
        let text = solve_off_thread(classifier, encode(render("MN89RS")))
            .await
            .unwrap();
        assert_eq!(text, "MN89RS");
    }
}
