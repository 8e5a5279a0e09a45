//! Function image builds.
//!
//! Every deploy builds a fresh image: the handler-runtime template is the
//! build context root, the staged function code goes under `fn/`, and the
//! template's Dockerfile assembles the two. Tags carry a random suffix so
//! a redeploy never races the previous deploy's image.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use bollard::{
    image::{BuildImageOptions, RemoveImageOptions},
    Docker,
};
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use nanoid::nanoid;
use tracing::{debug, info, warn};

use crate::{
    data_model::platform_labels,
    error::{Error, Result},
};

const TAG_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

pub struct ImageBuilder {
    docker: Arc<Docker>,
    template_dir: PathBuf,
}

impl ImageBuilder {
    pub fn new(docker: Arc<Docker>, template_dir: impl Into<PathBuf>) -> Self {
        ImageBuilder {
            docker,
            template_dir: template_dir.into(),
        }
    }

    /// Build the image for `name` from the staged source directory. Returns
    /// the image tag on success.
    pub async fn build(&self, name: &str, source_dir: &std::path::Path) -> Result<String> {
        let tag = format!("{}-{}", name, nanoid!(8, &TAG_ALPHABET));
        let context = self
            .build_context(source_dir)
            .context("failed to assemble image build context")?;
        info!(function = name, image = %tag, "building function image");

        let options = BuildImageOptions {
            t: tag.clone(),
            dockerfile: "Dockerfile".to_string(),
            rm: true,
            labels: platform_labels(name),
            ..Default::default()
        };
        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| Error::BuildFailed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(Error::BuildFailed(error));
            }
            if let Some(line) = info.stream {
                let line = line.trim();
                if !line.is_empty() {
                    debug!(function = name, "{line}");
                }
            }
        }
        Ok(tag)
    }

    /// Best effort: a failed removal leaves a dangling image, nothing more.
    pub async fn remove(&self, image: &str) {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_image(image, Some(options), None).await {
            if !super::engine_not_found(&e) {
                warn!(image, "failed to remove image: {e}");
            }
        }
    }

    fn build_context(&self, source_dir: &std::path::Path) -> anyhow::Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(".", &self.template_dir)
            .with_context(|| {
                format!(
                    "runtime template missing at {}",
                    self.template_dir.display()
                )
            })?;
        builder
            .append_dir_all("fn", source_dir)
            .context("failed to add function code to build context")?;
        let uncompressed = builder.into_inner()?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &uncompressed)?;
        Ok(encoder.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    fn context_paths(context: &[u8]) -> Vec<String> {
        let mut decompressed = Vec::new();
        flate2::read::GzDecoder::new(context)
            .read_to_end(&mut decompressed)
            .unwrap();
        let mut archive = tar::Archive::new(decompressed.as_slice());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_context_layout() {
        let template = TempDir::new().unwrap();
        std::fs::write(template.path().join("Dockerfile"), "FROM scratch").unwrap();
        std::fs::write(template.path().join("server.js"), "bootstrap").unwrap();
        let source = TempDir::new().unwrap();
        std::fs::write(source.path().join("index.js"), "handler").unwrap();

        let builder = ImageBuilder::new(
            Arc::new(Docker::connect_with_local_defaults().unwrap()),
            template.path(),
        );
        let context = builder.build_context(source.path()).unwrap();
        let paths = context_paths(&context);
        assert!(paths.iter().any(|p| p.ends_with("Dockerfile")));
        assert!(paths.iter().any(|p| p.ends_with("server.js")));
        assert!(paths.iter().any(|p| p.contains("fn/") && p.ends_with("index.js")));
    }

    #[test]
    fn test_build_context_requires_template() {
        let source = TempDir::new().unwrap();
        let builder = ImageBuilder::new(
            Arc::new(Docker::connect_with_local_defaults().unwrap()),
            "/nonexistent/template",
        );
        assert!(builder.build_context(source.path()).is_err());
    }
}
