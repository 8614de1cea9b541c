// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The per-project release manifest.

Projects describe how their release artifacts are built in a `trdl.yaml`
file at the root of the tagged worktree. The file is templated: `{{ .Tag }}`
is replaced with the tag being released before the YAML is parsed, so build
commands can bake the version into artifacts.
*/

use {
    crate::error::{PipelineError, Result},
    serde::Deserialize,
};

/// File name of the release manifest inside the worktree.
pub const MANIFEST_FILE_NAME: &str = "trdl.yaml";

/// Parsed and validated release manifest.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ReleaseManifest {
    /// Base image the release build runs in.
    #[serde(default)]
    pub docker_image: String,

    /// Shell commands run in order inside the build. The commands must leave
    /// the release artifacts in `/result`.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl ReleaseManifest {
    /// Parse manifest data, substituting the tag into the template first.
    pub fn parse(data: &[u8], tag: &str) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|e| {
            PipelineError::Other(format!("{} is not UTF-8: {}", MANIFEST_FILE_NAME, e))
        })?;

        let rendered = render_template(text, tag);

        let manifest: Self = serde_yaml::from_str(&rendered)?;
        manifest.validate()?;

        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.docker_image.is_empty() {
            return Err(PipelineError::BuildInstructionsFieldMissing("docker_image"));
        }

        if self.commands.is_empty() || self.commands.iter().any(|c| c.trim().is_empty()) {
            return Err(PipelineError::BuildInstructionsFieldMissing("commands"));
        }

        Ok(())
    }
}

fn render_template(text: &str, tag: &str) -> String {
    // Both spacings appear in the wild.
    text.replace("{{ .Tag }}", tag).replace("{{.Tag}}", tag)
}
