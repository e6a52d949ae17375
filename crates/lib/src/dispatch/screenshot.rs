//! Web screenshots through an external capture helper.

use super::DispatchError;
use crate::exec::CommandLine;
use base64::Engine;
use std::path::Path;

/// URL path prefix under which captured screenshots are served.
pub const SCREENSHOT_ROUTE: &str = "/webscreenshots";

/// Deterministic file name for a target URL (URL-safe base64 of the URL, `.jpg`).
pub fn snapshot_file_name(target: &str) -> String {
    format!(
        "{}.jpg",
        base64::engine::general_purpose::URL_SAFE.encode(target.as_bytes())
    )
}

/// Check that the target is an absolute URL.
pub fn validate_target(target: &str) -> Result<url::Url, DispatchError> {
    url::Url::parse(target).map_err(|e| DispatchError::TargetInvalid {
        label: "url",
        target: target.to_string(),
        reason: format!("ParseError - {}", e),
    })
}

/// `<helper> --url <target> --screenshot <path>`, each argument shell-quoted.
pub fn helper_command(helper: &Path, target: &str, output: &Path) -> CommandLine {
    CommandLine::Argv(vec![
        helper.to_string_lossy().into_owned(),
        "--url".to_string(),
        target.to_string(),
        "--screenshot".to_string(),
        output.to_string_lossy().into_owned(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_deterministic_and_path_safe() {
        let a = snapshot_file_name("https://example.com/a?b=c");
        assert_eq!(a, snapshot_file_name("https://example.com/a?b=c"));
        assert_ne!(a, snapshot_file_name("https://example.com/"));
        assert!(a.ends_with(".jpg"));
        assert!(!a.contains('/'));
        // "??>" encodes to "Pz8-" in the URL-safe alphabet, "Pz8+" in the standard one
        assert_eq!(snapshot_file_name("??>"), "Pz8-.jpg");
    }

    #[test]
    fn rejects_relative_targets() {
        assert!(validate_target("https://example.com").is_ok());
        let err = validate_target("not a url").unwrap_err();
        assert!(err.to_string().starts_with("url: not a url is not valid."));
    }

    #[test]
    fn helper_arguments_are_quoted() {
        let cmd = helper_command(
            Path::new("/opt/web_screenshot.py"),
            "https://example.com/?a=1&b=2",
            Path::new("/tmp/shots/x.jpg"),
        );
        let joined = cmd.joined().unwrap();
        assert_eq!(
            shlex::split(&joined).unwrap(),
            vec![
                "/opt/web_screenshot.py",
                "--url",
                "https://example.com/?a=1&b=2",
                "--screenshot",
                "/tmp/shots/x.jpg"
            ]
        );
    }
}
