//! Camera-side configuration consumed by the scheduler: readout timing for the readiness model and
//! the image transform a camera applies, as written in device configuration.

use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

use crate::error::{ScheduleError, ScheduleResult};
use crate::time::Time;

static TRANSFORM_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn transform_regex() -> ScheduleResult<&'static Regex> {
    TRANSFORM_RE
        .get_or_init(|| {
            Regex::new(r"^\(lr=(True|False),\s*ud=(True|False),\s*rot=(True|False)\)$")
        })
        .as_ref()
        .map_err(|e| ScheduleError::InvalidTransform(e.to_string()))
}

/// Timing properties the readiness model needs from a camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraTiming {
    /// Time after the end of an exposure before the camera accepts the next trigger.
    pub readout_time: Time,
}
impl CameraTiming {
    pub fn new(readout_time: Time) -> Self {
        Self { readout_time }
    }
}

/// Orientation fix-up applied to images: flip left-right, flip up-down, rotate by 90 degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraTransform {
    pub lr: bool,
    pub ud: bool,
    pub rot: bool,
}

impl CameraTransform {
    pub fn new(lr: bool, ud: bool, rot: bool) -> Self {
        Self { lr, ud, rot }
    }

    /// Parses `"(lr=True, ud=False, rot=True)"`.
    ///
    /// An empty string is the identity transform. The older `"(1, 0, 1)"` form is still accepted
    /// but logs a deprecation warning.
    ///
    /// ```
    /// use acqcompiler_backend::camera::CameraTransform;
    ///
    /// let t = CameraTransform::parse("(lr=True,ud=False,rot=True)").unwrap();
    /// assert_eq!(t, CameraTransform::new(true, false, true));
    /// assert_eq!(CameraTransform::parse("").unwrap(), CameraTransform::default());
    /// assert!(CameraTransform::parse("(lr=yes)").is_err());
    /// ```
    pub fn parse(text: &str) -> ScheduleResult<Self> {
        if text.is_empty() {
            return Ok(Self::default());
        }
        if let Some(caps) = transform_regex()?.captures(text) {
            return Ok(Self::new(
                &caps[1] == "True",
                &caps[2] == "True",
                &caps[3] == "True",
            ));
        }

        let flags = text
            .trim_matches(|c| c == '(' || c == ')')
            .split(',')
            .map(|part| part.trim().parse::<i64>().map(|v| v != 0))
            .collect::<Result<Vec<bool>, _>>()
            .map_err(|_| ScheduleError::InvalidTransform(text.to_string()))?;
        match flags[..] {
            [lr, ud, rot] => {
                warn!(
                    "Specifying camera transform in the format '([1|0], [1|0], [1|0])' is deprecated. \
                     Use '(lr=[True|False], ud=[True|False], rot=[True|False])' instead (got '{}')",
                    text
                );
                Ok(Self::new(lr, ud, rot))
            }
            _ => Err(ScheduleError::InvalidTransform(text.to_string())),
        }
    }

    /// Combines this fixed camera transform with the transform of the current imaging path.
    /// Flips cancel each other out; two rotations amount to flipping both axes.
    pub fn compose(self, path: CameraTransform) -> CameraTransform {
        let mut lr = self.lr ^ path.lr;
        let mut ud = self.ud ^ path.ud;
        if self.rot && path.rot {
            lr = !lr;
            ud = !ud;
        }
        CameraTransform::new(lr, ud, self.rot ^ path.rot)
    }
}

impl FromStr for CameraTransform {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transform_regex_is_compiled_once() {
        let first = transform_regex().unwrap() as *const Regex;
        CameraTransform::parse("(lr=True, ud=False, rot=False)").unwrap();
        let second = transform_regex().unwrap() as *const Regex;
        assert_eq!(first, second);
    }

    #[test]
    fn parses_every_flag_combination() {
        let cases = [
            ("(lr=True, ud=True, rot=True)", (true, true, true)),
            ("(lr=False, ud=True, rot=True)", (false, true, true)),
            ("(lr=True, ud=False, rot=True)", (true, false, true)),
            ("(lr=True, ud=True, rot=False)", (true, true, false)),
        ];
        for (text, (lr, ud, rot)) in cases {
            assert_eq!(
                CameraTransform::parse(text).unwrap(),
                CameraTransform::new(lr, ud, rot)
            );
        }
    }

    #[test]
    fn legacy_integer_form() {
        assert_eq!(
            "(1, 0, 1)".parse::<CameraTransform>().unwrap(),
            CameraTransform::new(true, false, true)
        );
        assert!(CameraTransform::parse("(1, 0)").is_err());
        assert!(CameraTransform::parse("(lr=True, ud=True)").is_err());
        assert!(CameraTransform::parse("   ").is_err());
    }

    #[test]
    fn composition() {
        let base = CameraTransform::new(true, false, true);
        assert_eq!(
            base.compose(CameraTransform::default()),
            base
        );
        assert_eq!(
            base.compose(CameraTransform::new(true, false, false)),
            CameraTransform::new(false, false, true)
        );
        // Two rotations cancel, flipping both axes instead
        assert_eq!(
            base.compose(CameraTransform::new(false, false, true)),
            CameraTransform::new(false, true, false)
        );
    }
}
