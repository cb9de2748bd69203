use anyhow::{bail, Context, Result};
use fashionista_contracts::descriptor::TransformDescriptor;
use url::Url;

pub const DELIVERY_BASE_DEFAULT: &str = "https://res.cloudinary.com";
pub const CLOUD_NAME_DEFAULT: &str = "fashionista-ai";

/// Resolves descriptors into renderable delivery URLs:
/// `<base>/<cloud>/image/upload/<component>/.../<public_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUrlBuilder {
    base: Url,
    cloud_name: String,
}

impl DeliveryUrlBuilder {
    pub fn new(base: &str, cloud_name: &str) -> Result<Self> {
        let base = Url::parse(base.trim()).with_context(|| format!("invalid delivery base '{base}'"))?;
        if base.cannot_be_a_base() {
            bail!("delivery base '{base}' cannot carry a path");
        }
        let cloud_name = cloud_name.trim();
        if cloud_name.is_empty() || cloud_name.contains('/') {
            bail!("invalid cloud name '{cloud_name}'");
        }
        Ok(Self {
            base,
            cloud_name: cloud_name.to_string(),
        })
    }

    pub fn cloudinary(cloud_name: &str) -> Result<Self> {
        Self::new(DELIVERY_BASE_DEFAULT, cloud_name)
    }

    pub fn url(&self, descriptor: &TransformDescriptor) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push(&self.cloud_name)
                .push("image")
                .push("upload");
            for component in descriptor.components() {
                segments.push(&component);
            }
            segments.extend(
                descriptor
                    .handle()
                    .public_id()
                    .split('/')
                    .filter(|part| !part.is_empty()),
            );
        }
        url.to_string()
    }
}
