//! Detection results produced by validation and prediction passes.

use serde::{Deserialize, Serialize};

/// Axis-aligned box in image-relative coordinates (`0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// A single detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// All detections for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedImage {
    pub image: String,
    pub detections: Vec<Detection>,
}

/// Output of a finished prediction job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub images: Vec<PredictedImage>,
}

/// Column order of the CSV export.
const CSV_HEADER: [&str; 8] = ["image", "class_id", "class_name", "score", "x", "y", "w", "h"];

/// One CSV line. Detection columns are empty for an image with no
/// detections.
#[derive(Serialize)]
struct CsvRow<'a> {
    image: &'a str,
    class_id: Option<u32>,
    class_name: Option<&'a str>,
    score: Option<f64>,
    x: Option<f64>,
    y: Option<f64>,
    w: Option<f64>,
    h: Option<f64>,
}

impl<'a> CsvRow<'a> {
    fn empty(image: &'a str) -> Self {
        Self {
            image,
            class_id: None,
            class_name: None,
            score: None,
            x: None,
            y: None,
            w: None,
            h: None,
        }
    }

    fn detection(image: &'a str, det: &'a Detection) -> Self {
        Self {
            image,
            class_id: Some(det.class_id),
            class_name: Some(&det.class_name),
            score: Some(det.score),
            x: Some(det.bbox.x),
            y: Some(det.bbox.y),
            w: Some(det.bbox.w),
            h: Some(det.bbox.h),
        }
    }
}

impl PredictionResult {
    pub fn detection_count(&self) -> usize {
        self.images.iter().map(|img| img.detections.len()).sum()
    }

    /// Render the result as CSV with a header line and one row per
    /// detection, in image order.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(CSV_HEADER)?;

        for image in &self.images {
            if image.detections.is_empty() {
                writer.serialize(CsvRow::empty(&image.image))?;
            }
            for det in &image.detections {
                writer.serialize(CsvRow::detection(&image.image, det))?;
            }
        }

        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_serializes_under_box_key() {
        let det = Detection {
            class_id: 3,
            class_name: "dog".into(),
            score: 0.8,
            bbox: BoundingBox {
                x: 0.1,
                y: 0.2,
                w: 0.3,
                h: 0.4,
            },
        };
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["box"]["w"], 0.3);
        assert!(json.get("bbox").is_none());
    }

    #[test]
    fn csv_has_one_row_per_detection() {
        let det = Detection {
            class_id: 2,
            class_name: "car".into(),
            score: 0.5,
            bbox: BoundingBox {
                x: 0.25,
                y: 0.5,
                w: 0.125,
                h: 0.75,
            },
        };
        let result = PredictionResult {
            images: vec![
                PredictedImage {
                    image: "a.jpg".into(),
                    detections: vec![det.clone(), det],
                },
                PredictedImage {
                    image: "b.jpg".into(),
                    detections: Vec::new(),
                },
            ],
        };

        let csv = String::from_utf8(result.to_csv().unwrap()).unwrap();
        assert_eq!(
            csv,
            "image,class_id,class_name,score,x,y,w,h\n\
             a.jpg,2,car,0.5,0.25,0.5,0.125,0.75\n\
             a.jpg,2,car,0.5,0.25,0.5,0.125,0.75\n\
             b.jpg,,,,,,,\n"
        );
    }

    #[test]
    fn empty_result_is_just_the_header() {
        let csv = PredictionResult::default().to_csv().unwrap();
        assert_eq!(csv, b"image,class_id,class_name,score,x,y,w,h\n");
    }

    #[test]
    fn detection_count_sums_all_images() {
        let det = Detection {
            class_id: 0,
            class_name: "cat".into(),
            score: 0.5,
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
            },
        };
        let result = PredictionResult {
            images: vec![
                PredictedImage {
                    image: "a.jpg".into(),
                    detections: vec![det.clone(), det.clone()],
                },
                PredictedImage {
                    image: "b.jpg".into(),
                    detections: vec![det],
                },
            ],
        };
        assert_eq!(result.detection_count(), 3);
    }
}
