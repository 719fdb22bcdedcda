use flate2::write::GzEncoder;
use flate2::Compression;
use tar::Header;

use super::{BuildContext, StageError};

/// Schema version of the flow document the runtime image understands.
const FLOW_SCHEMA_VERSION: &str = "1";

/// Top-level keys every flow document must carry. The catalog stores configs
/// opaquely; this is the one place their shape is checked.
const REQUIRED_KEYS: [&str; 2] = ["nodes", "edges"];

#[derive(Clone, Debug)]
pub struct ContextSettings {
    /// Base image the agent runtime ships in.
    pub runtime_image: String,
}

/// Render the templated build context for one agent version and pack it into
/// an in-memory gzipped tar.
pub fn materialize(
    flow_config: &serde_json::Value,
    image_tag: &str,
    settings: &ContextSettings,
) -> Result<BuildContext, StageError> {
    for key in REQUIRED_KEYS {
        if flow_config.get(key).is_none() {
            return Err(StageError::Fatal(format!(
                "flow document is missing required key '{key}'"
            )));
        }
    }

    let flow_artifact = serde_json::to_vec_pretty(&serde_json::json!({
        "schema_version": FLOW_SCHEMA_VERSION,
        "flow": flow_config,
    }))
    .map_err(|err| StageError::Fatal(format!("failed to serialize flow artifact: {err}")))?;

    let dockerfile = format!(
        "FROM {image}\n\
         ENV PORT=8080\n\
         COPY flow.json /app/flow.json\n\
         EXPOSE 8080\n\
         CMD [\"agent-runtime\", \"--flow\", \"/app/flow.json\"]\n",
        image = settings.runtime_image,
    );

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    append_file(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
    append_file(&mut builder, "flow.json", &flow_artifact)?;

    let archive = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|err| StageError::Fatal(format!("failed to pack build context: {err}")))?;

    Ok(BuildContext {
        archive,
        image_tag: image_tag.to_string(),
    })
}

fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    contents: &[u8],
) -> Result<(), StageError> {
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append_data(&mut header, name, contents)
        .map_err(|err| StageError::Fatal(format!("failed to append {name}: {err}")))
}
