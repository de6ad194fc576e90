//! Detection results and the ground truth detection file.

use crate::common::*;

/// A detected object in ratio units of the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub rect: CyCxHW<R64>,
    pub class: i64,
    pub score: R64,
}

impl Detection {
    /// Builds a detection from a `[t, l, b, r]` box in ratio units.
    pub fn from_tlbr(tlbr: [f64; 4], class: i64, score: f64) -> Result<Self> {
        let [t, l, b, r] = tlbr;
        ensure!(
            [t, l, b, r, score].iter().all(|value| value.is_finite()),
            "detection values must be finite"
        );
        let rect = CyCxHW::try_from_tlbr([r64(t), r64(l), r64(b), r64(r)])?;
        Ok(Self {
            rect,
            class,
            score: r64(score),
        })
    }

    /// Converts an `[N, 6]` tensor of `t, l, b, r, score, class` rows to detections.
    pub fn from_tensor(tensor: &Tensor) -> Result<Vec<Self>> {
        let (num, cols) = tensor.size2()?;
        ensure!(cols == 6, "expect a [N, 6] detection tensor, but get [{}, {}]", num, cols);

        let values = Vec::<f64>::from(&tensor.to_kind(Kind::Double).contiguous().view([-1]));
        values
            .chunks(6)
            .map(|row| Self::from_tlbr([row[0], row[1], row[2], row[3]], row[5] as i64, row[4]))
            .try_collect()
    }

    /// Converts detections to an `[N, 6]` tensor of `t, l, b, r, score, class` rows.
    pub fn to_tensor(detections: &[Self], device: Device) -> Tensor {
        let values: Vec<f32> = detections
            .iter()
            .flat_map(|det| {
                let [t, l, b, r] = det.rect.tlbr();
                [t, l, b, r, det.score, r64(det.class as f64)]
            })
            .map(|value| value.raw() as f32)
            .collect();
        Tensor::of_slice(&values)
            .view([detections.len() as i64, 6])
            .to_device(device)
    }
}

/// Detection filtering options.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    pub confidence_threshold: R64,
    pub class_whitelist: Option<HashSet<i64>>,
}

impl DetectionFilter {
    pub fn accepts(&self, detection: &Detection) -> bool {
        let class_ok = self
            .class_whitelist
            .as_ref()
            .map(|whitelist| whitelist.contains(&detection.class))
            .unwrap_or(true);
        detection.score >= self.confidence_threshold && class_ok
    }

    pub fn apply(&self, detections: impl IntoIterator<Item = Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|det| self.accepts(det))
            .collect()
    }
}

/// A ground truth detection file entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// The box in `[cy, cx, h, w]` ratio units.
    pub cycxhw: [f64; 4],
    pub class: i64,
    pub score: f64,
}

impl TryFrom<&DetectionRecord> for Detection {
    type Error = Error;

    fn try_from(from: &DetectionRecord) -> Result<Self> {
        let [cy, cx, h, w] = from.cycxhw;
        ensure!(
            [cy, cx, h, w, from.score].iter().all(|value| value.is_finite()),
            "detection values must be finite"
        );
        Ok(Self {
            rect: CyCxHW::try_from_cycxhw([r64(cy), r64(cx), r64(h), r64(w)])?,
            class: from.class,
            score: r64(from.score),
        })
    }
}

/// Loads ground truth detections keyed by frame id from a JSON file.
///
/// The file is a map from frame id to a list of [DetectionRecord]s.
pub fn load_ground_truth(path: &Path) -> Result<HashMap<i64, Vec<Detection>>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read ground truth file '{}'", path.display()))?;
    let records: HashMap<String, Vec<DetectionRecord>> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse ground truth file '{}'", path.display()))?;

    records
        .into_iter()
        .map(|(key, records)| -> Result<_> {
            let fid: i64 = key
                .parse()
                .with_context(|| format!("invalid frame id '{}' in '{}'", key, path.display()))?;
            let detections: Vec<Detection> = records
                .iter()
                .map(Detection::try_from)
                .try_collect::<_, Vec<_>, Error>()
                .with_context(|| format!("invalid detection of frame {}", fid))?;
            Ok((fid, detections))
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_by_score_and_class() -> Result<()> {
        let person = Detection::from_tlbr([0.1, 0.1, 0.5, 0.5], 0, 0.9)?;
        let weak = Detection::from_tlbr([0.1, 0.1, 0.5, 0.5], 0, 0.2)?;
        let dog = Detection::from_tlbr([0.1, 0.1, 0.5, 0.5], 16, 0.8)?;

        let filter = DetectionFilter {
            confidence_threshold: r64(0.5),
            class_whitelist: Some(HashSet::from([0])),
        };
        let kept = filter.apply(vec![person.clone(), weak, dog.clone()]);
        assert_eq!(kept, vec![person.clone()]);

        let filter = DetectionFilter {
            confidence_threshold: r64(0.5),
            class_whitelist: None,
        };
        assert_eq!(filter.apply(vec![person.clone(), dog.clone()]).len(), 2);
        Ok(())
    }

    #[test]
    fn tensor_conversion() -> Result<()> {
        let dets = vec![
            Detection::from_tlbr([0.0, 0.25, 0.5, 0.75], 3, 0.5)?,
            Detection::from_tlbr([0.5, 0.5, 1.0, 1.0], 1, 1.0)?,
        ];
        let tensor = Detection::to_tensor(&dets, Device::Cpu);
        assert_eq!(tensor.size(), [2, 6]);
        assert_eq!(Detection::from_tensor(&tensor)?, dets);

        let empty = Detection::to_tensor(&[], Device::Cpu);
        assert_eq!(empty.size(), [0, 6]);
        assert!(Detection::from_tensor(&empty)?.is_empty());
        Ok(())
    }

    #[test]
    fn parse_ground_truth_records() -> Result<()> {
        let text = r#"{ "3": [ { "cycxhw": [0.5, 0.5, 0.2, 0.4], "class": 2, "score": 0.7 } ], "4": [] }"#;
        let records: HashMap<String, Vec<DetectionRecord>> = serde_json::from_str(text)?;
        let det = Detection::try_from(&records["3"][0])?;
        let expect = [0.4, 0.3, 0.6, 0.7];
        izip!(det.rect.tlbr(), expect).for_each(|(value, expect)| {
            assert!((value.raw() - expect).abs() < 1e-9);
        });
        assert!(records["4"].is_empty());
        Ok(())
    }
}
