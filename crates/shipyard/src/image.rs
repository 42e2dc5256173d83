/// Image pulled by remote agents when no override is configured.
pub const DEFAULT_IMAGE_REF: &str = "ghcr.io/shipyard-dev/agent:latest";

/// Pick the image reference for a remote agent. Blank overrides fall back to
/// the default.
pub fn resolve_image_ref(override_ref: Option<&str>) -> String {
    override_ref
        .map(str::trim)
        .filter(|image| !image.is_empty())
        .unwrap_or(DEFAULT_IMAGE_REF)
        .to_string()
}
