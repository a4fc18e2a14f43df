//! Per-image analysis plan handed to the collaborator.
//!
//! The engine does not run the image pipeline itself, but it resolves the
//! parts of the configuration that are cheap to get wrong: which channels are
//! analysed with which threshold, the theoretical PSF size, and where every
//! artifact is written.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AnalysisParams;
use crate::error::ProcessError;

/// Microscope geometry used by the PSF model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Microscope {
    Widefield,
    Confocal,
    Nipkow,
}

impl FromStr for Microscope {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "widefield" => Ok(Self::Widefield),
            "confocal" => Ok(Self::Confocal),
            "nipkow" => Ok(Self::Nipkow),
            other => Err(ProcessError::InvalidParameters(format!(
                "unrecognised microscope {other:?}"
            ))),
        }
    }
}

/// Theoretical PSF standard deviations, in the units of the wavelengths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PsfSize {
    pub z: f64,
    pub yx: f64,
}

/// Theoretical PSF size for the given excitation/emission wavelengths,
/// numerical aperture and refractive index.
pub fn calculate_psf(ex: f64, em: f64, na: f64, ri: f64, microscope: Microscope) -> PsfSize {
    match microscope {
        Microscope::Widefield => PsfSize {
            yx: 0.225 * em / na,
            z: 0.78 * ri * em / na.powi(2),
        },
        Microscope::Confocal | Microscope::Nipkow => {
            let combined = ex * em / (ex.powi(2) + em.powi(2)).sqrt();
            PsfSize {
                yx: 0.225 / na * combined,
                z: 0.78 * ri / na.powi(2) * combined,
            }
        }
    }
}

/// PSF size from the configured optics.
///
/// Returns `None` when no optics keys are set, and an error when only some
/// of them are.
pub fn psf_from_params(params: &AnalysisParams) -> Result<Option<PsfSize>, ProcessError> {
    let keys = (
        params.ex,
        params.em,
        params.na,
        params.ri,
        params.microscope.as_deref(),
    );
    match keys {
        (None, None, None, None, None) => Ok(None),
        (Some(ex), Some(em), Some(na), Some(ri), Some(microscope)) => {
            if na <= 0.0 {
                return Err(ProcessError::InvalidParameters(
                    "NA must be positive".to_string(),
                ));
            }
            Ok(Some(calculate_psf(ex, em, na, ri, microscope.parse()?)))
        }
        _ => Err(ProcessError::InvalidParameters(
            "ex, em, NA, RI and microscope must be set together".to_string(),
        )),
    }
}

/// One channel to analyse and the spot threshold it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPlan {
    /// Zero-based channel index in the image.
    pub channel: usize,
    pub threshold: f64,
    /// Reference-spot image written for this channel.
    pub reference_spot: PathBuf,
}

/// Match each configured channel with its threshold.
///
/// A channel that is neither `smFISH_ch1` nor `smFISH_ch2`, or whose
/// threshold is missing, is logged and skipped.
pub fn channel_plans(
    params: &AnalysisParams,
    image_name: &str,
    refspot_dir: &Path,
) -> Vec<ChannelPlan> {
    params
        .channels
        .iter()
        .filter_map(|&channel| {
            let threshold = if Some(channel) == params.smfish_ch1 {
                params.smfish_ch1_thresh
            } else if Some(channel) == params.smfish_ch2 {
                params.smfish_ch2_thresh
            } else {
                None
            };

            match threshold {
                Some(threshold) => Some(ChannelPlan {
                    channel,
                    threshold,
                    reference_spot: reference_spot_path(refspot_dir, image_name, channel),
                }),
                None => {
                    warn!(
                        channel,
                        image = image_name,
                        "smFISH channel and threshold not correctly defined, skipping channel"
                    );
                    None
                }
            }
        })
        .collect()
}

/// Intensity clip applied before segmentation, for images whose name
/// contains `cp_search_string`.
pub fn segmentation_clip(params: &AnalysisParams, image_name: &str) -> Option<f64> {
    match (&params.cp_search_string, params.cp_clip) {
        (Some(needle), Some(clip)) if image_name.contains(needle.as_str()) => Some(clip),
        _ => None,
    }
}

/// `<output_dir>/<image>_ch<channel+1>_results_cell_<cell>.npz`
pub fn cell_result_path(output_dir: &Path, image_name: &str, channel: usize, cell: usize) -> PathBuf {
    output_dir.join(format!(
        "{image_name}_ch{}_results_cell_{cell}.npz",
        channel + 1
    ))
}

/// `<refspot_dir>/<image>_reference_spot_ch<channel+1>.tif`
pub fn reference_spot_path(refspot_dir: &Path, image_name: &str, channel: usize) -> PathBuf {
    refspot_dir.join(format!(
        "{image_name}_reference_spot_ch{}.tif",
        channel + 1
    ))
}

/// Artifacts present on disk for an image: per-cell results (contiguous from
/// cell 0) and the reference spot of every planned channel.
pub async fn collect_artifacts(
    output_dir: &Path,
    image_name: &str,
    plans: &[ChannelPlan],
) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for plan in plans {
        for cell in 0.. {
            let path = cell_result_path(output_dir, image_name, plan.channel, cell);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                break;
            }
            found.push(path);
        }
        if tokio::fs::try_exists(&plan.reference_spot)
            .await
            .unwrap_or(false)
        {
            found.push(plan.reference_spot.clone());
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn params() -> AnalysisParams {
        AnalysisParams {
            channels: vec![1, 2, 3],
            smfish_ch1: Some(1),
            smfish_ch1_thresh: Some(12.0),
            smfish_ch2: Some(2),
            smfish_ch2_thresh: Some(8.5),
            ..AnalysisParams::default()
        }
    }

    #[test]
    fn widefield_psf() {
        let psf = calculate_psf(570.0, 610.0, 1.4, 1.515, Microscope::Widefield);
        assert!(approx(psf.yx, 0.225 * 610.0 / 1.4));
        assert!(approx(psf.z, 0.78 * 1.515 * 610.0 / (1.4 * 1.4)));
    }

    #[test]
    fn confocal_and_nipkow_share_formula() {
        let confocal = calculate_psf(570.0, 610.0, 1.4, 1.515, Microscope::Confocal);
        let nipkow = calculate_psf(570.0, 610.0, 1.4, 1.515, Microscope::Nipkow);
        assert_eq!(confocal, nipkow);

        let combined = 570.0 * 610.0 / (570.0f64.powi(2) + 610.0f64.powi(2)).sqrt();
        assert!(approx(confocal.yx, 0.225 / 1.4 * combined));
        // Confocal blur is always tighter than widefield for the same optics.
        let widefield = calculate_psf(570.0, 610.0, 1.4, 1.515, Microscope::Widefield);
        assert!(confocal.yx < widefield.yx);
    }

    #[test]
    fn microscope_names_parse() {
        assert_eq!("Confocal".parse::<Microscope>().unwrap(), Microscope::Confocal);
        assert!("lightsheet".parse::<Microscope>().is_err());
    }

    #[test]
    fn psf_requires_all_optics_or_none() {
        assert_eq!(psf_from_params(&AnalysisParams::default()).unwrap(), None);

        let partial = AnalysisParams {
            em: Some(610.0),
            ..AnalysisParams::default()
        };
        assert!(psf_from_params(&partial).is_err());

        let full = AnalysisParams {
            ex: Some(570.0),
            em: Some(610.0),
            na: Some(1.4),
            ri: Some(1.515),
            microscope: Some("widefield".into()),
            ..AnalysisParams::default()
        };
        assert!(psf_from_params(&full).unwrap().is_some());
    }

    #[test]
    fn unmatched_channel_is_skipped() {
        let plans = channel_plans(&params(), "img", Path::new("/ref"));
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].channel, 1);
        assert_eq!(plans[0].threshold, 12.0);
        assert_eq!(plans[1].threshold, 8.5);
        assert_eq!(
            plans[1].reference_spot,
            PathBuf::from("/ref/img_reference_spot_ch3.tif")
        );
    }

    #[test]
    fn clip_applies_only_to_matching_images() {
        let params = AnalysisParams {
            cp_search_string: Some("DAPI".into()),
            cp_clip: Some(1000.0),
            ..AnalysisParams::default()
        };
        assert_eq!(segmentation_clip(&params, "well3_DAPI_01"), Some(1000.0));
        assert_eq!(segmentation_clip(&params, "well3_01"), None);
    }

    #[test]
    fn artifact_names_use_one_based_channels() {
        assert_eq!(
            cell_result_path(Path::new("/out"), "img", 0, 7),
            PathBuf::from("/out/img_ch1_results_cell_7.npz")
        );
        assert_eq!(
            reference_spot_path(Path::new("/ref"), "img", 1),
            PathBuf::from("/ref/img_reference_spot_ch2.tif")
        );
    }

    #[tokio::test]
    async fn collects_contiguous_artifacts() {
        let out = tempfile::tempdir().unwrap();
        let refs = tempfile::tempdir().unwrap();
        let plans = channel_plans(&params(), "img", refs.path());

        for cell in [0, 1, 3] {
            std::fs::write(cell_result_path(out.path(), "img", 1, cell), b"").unwrap();
        }
        std::fs::write(&plans[0].reference_spot, b"").unwrap();

        let found = collect_artifacts(out.path(), "img", &plans).await;
        assert_eq!(found.len(), 3);
        assert!(found.contains(&plans[0].reference_spot));
    }
}
