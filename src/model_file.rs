//! Camera-model text file format: a bracket-delimited dictionary with
//! `lensmodel`, `intrinsics`, `imagersize`, and an optional `extrinsics`
//! key. Hand-written reader/writer rather than a `serde_json` derive,
//! since the format's quoting and trailing-comma conventions don't match
//! JSON.

use crate::error::{Error, Result};
use crate::lens::LensModel;
use crate::transform::Pose;

#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub lens_model: LensModel,
    pub intrinsics: Vec<f64>,
    pub imager_width: u32,
    pub imager_height: u32,
    pub extrinsics: Option<Pose>,
}

impl CameraModel {
    pub fn validate(&self) -> Result<()> {
        let expected = self.lens_model.num_intrinsics_params();
        if self.intrinsics.len() != expected {
            return Err(Error::BufferSizeMismatch {
                what: "camera model intrinsics",
                expected,
                actual: self.intrinsics.len(),
            });
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        let mut out = String::from("{\n");
        out.push_str(&format!("  'lensmodel': '{}',\n", self.lens_model.name()));
        out.push_str("  'intrinsics': [");
        for v in &self.intrinsics {
            out.push_str(&format!("{v}, "));
        }
        out.push_str("],\n");
        out.push_str(&format!(
            "  'imagersize': [{}, {}],\n",
            self.imager_width, self.imager_height
        ));
        if let Some(ext) = &self.extrinsics {
            let a = ext.to_array();
            out.push_str(&format!(
                "  'extrinsics': [{}, {}, {}, {}, {}, {}],\n",
                a[0], a[1], a[2], a[3], a[4], a[5]
            ));
        }
        out.push('}');
        out
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let lens_model_str = extract_string_value(text, "lensmodel")?;
        let lens_model = LensModel::parse(&lens_model_str)?;

        let intrinsics = extract_float_list(text, "intrinsics")?;
        let imagersize = extract_float_list(text, "imagersize")?;
        if imagersize.len() != 2 {
            return Err(Error::ModelFileParse("imagersize must have exactly 2 entries".into()));
        }
        let extrinsics = if text.contains("'extrinsics'") || text.contains("\"extrinsics\"") {
            let v = extract_float_list(text, "extrinsics")?;
            if v.len() != 6 {
                return Err(Error::ModelFileParse("extrinsics must have exactly 6 entries".into()));
            }
            Some(Pose::from_slice(&v))
        } else {
            None
        };

        let model = CameraModel {
            lens_model,
            intrinsics,
            imager_width: imagersize[0] as u32,
            imager_height: imagersize[1] as u32,
            extrinsics,
        };
        model.validate()?;
        Ok(model)
    }
}

fn extract_string_value(text: &str, key: &str) -> Result<String> {
    let key_pos = find_key(text, key)
        .ok_or_else(|| Error::ModelFileParse(format!("missing key '{key}'")))?;
    let rest = &text[key_pos..];
    let colon = rest.find(':').ok_or_else(|| Error::ModelFileParse(format!("malformed entry for '{key}'")))?;
    let after_colon = &rest[colon + 1..];
    let quote_style = after_colon
        .trim_start()
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| Error::ModelFileParse(format!("expected quoted string value for '{key}'")))?;
    let start = after_colon.find(quote_style).unwrap() + 1;
    let value_and_rest = &after_colon[start..];
    let end = value_and_rest
        .find(quote_style)
        .ok_or_else(|| Error::ModelFileParse(format!("unterminated string value for '{key}'")))?;
    Ok(value_and_rest[..end].to_string())
}

fn extract_float_list(text: &str, key: &str) -> Result<Vec<f64>> {
    let key_pos = find_key(text, key)
        .ok_or_else(|| Error::ModelFileParse(format!("missing key '{key}'")))?;
    let rest = &text[key_pos..];
    let open = rest.find('[').ok_or_else(|| Error::ModelFileParse(format!("expected '[' after '{key}'")))?;
    let close = rest[open..]
        .find(']')
        .ok_or_else(|| Error::ModelFileParse(format!("unterminated list for '{key}'")))?
        + open;
    rest[open + 1..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().map_err(|_| Error::ModelFileParse(format!("bad float in '{key}': {s}"))))
        .collect()
}

fn find_key(text: &str, key: &str) -> Option<usize> {
    text.find(&format!("'{key}'")).or_else(|| text.find(&format!("\"{key}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_pinhole_with_extrinsics() {
        let model = CameraModel {
            lens_model: LensModel::Pinhole,
            intrinsics: vec![1000.0, 1000.0, 500.0, 500.0],
            imager_width: 1000,
            imager_height: 1000,
            extrinsics: Some(Pose {
                r: nalgebra::Vector3::new(0.1, 0.2, 0.3),
                t: nalgebra::Vector3::new(1.0, 2.0, 3.0),
            }),
        };
        let text = model.to_text();
        let parsed = CameraModel::from_text(&text).unwrap();
        assert_eq!(parsed, model);
    }

    #[test]
    fn roundtrips_without_extrinsics() {
        let model = CameraModel {
            lens_model: LensModel::OpenCv4,
            intrinsics: vec![900.0, 900.0, 480.0, 270.0, 0.1, -0.02, 0.001, -0.0005],
            imager_width: 960,
            imager_height: 540,
            extrinsics: None,
        };
        let text = model.to_text();
        let parsed = CameraModel::from_text(&text).unwrap();
        assert_eq!(parsed, model);
    }

    #[test]
    fn rejects_wrong_intrinsics_count() {
        let text = "{ 'lensmodel': 'PINHOLE', 'intrinsics': [1.0, 2.0], 'imagersize': [100, 100] }";
        assert!(CameraModel::from_text(text).is_err());
    }
}
