//! GLSL shaders of the Kestrel engine and their SPIR-V.
//!
//! With the `compile` feature the shaders are compiled by the build script
//! and embedded. Without it, SPIR-V is read at runtime from a directory
//! holding one `.spv` file per shader, named by [`ShaderId::spirv_name`].

use std::path::{Path, PathBuf};
#[cfg(feature = "compile")]
use std::sync::OnceLock;
use thiserror::Error;

/// SPIR-V magic number, first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader loading errors.
#[derive(Error, Debug)]
pub enum ShaderError {
    #[error("Failed to read shader {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{name} is not valid SPIR-V: {reason}")]
    InvalidSpirv { name: String, reason: String },

    #[error("Shaders were not embedded; build with the `compile` feature or load from a directory")]
    NotEmbedded,
}

pub type Result<T> = std::result::Result<T, ShaderError>;

/// Pipeline stage a shader runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Compute,
    Vertex,
    Fragment,
}

/// Every shader the renderer uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderId {
    /// Frustum culling and indirect draw generation.
    Cull,
    /// Linear blend skinning.
    Skin,
    MeshVert,
    MeshFrag,
    /// Depth-only vertex shader of the shadow pass.
    ShadowVert,
}

impl ShaderId {
    pub const ALL: [Self; 5] = [
        Self::Cull,
        Self::Skin,
        Self::MeshVert,
        Self::MeshFrag,
        Self::ShadowVert,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// GLSL source file name under `shaders/`.
    pub const fn source_name(self) -> &'static str {
        match self {
            Self::Cull => "cull.comp",
            Self::Skin => "skin.comp",
            Self::MeshVert => "mesh.vert",
            Self::MeshFrag => "mesh.frag",
            Self::ShadowVert => "shadow.vert",
        }
    }

    /// Compiled file name.
    pub const fn spirv_name(self) -> &'static str {
        match self {
            Self::Cull => "cull.spv",
            Self::Skin => "skin.spv",
            Self::MeshVert => "mesh_vert.spv",
            Self::MeshFrag => "mesh_frag.spv",
            Self::ShadowVert => "shadow_vert.spv",
        }
    }

    pub const fn stage(self) -> ShaderStage {
        match self {
            Self::Cull | Self::Skin => ShaderStage::Compute,
            Self::MeshVert | Self::ShadowVert => ShaderStage::Vertex,
            Self::MeshFrag => ShaderStage::Fragment,
        }
    }

    /// GLSL source text.
    pub const fn source(self) -> &'static str {
        match self {
            Self::Cull => include_str!("../shaders/cull.comp"),
            Self::Skin => include_str!("../shaders/skin.comp"),
            Self::MeshVert => include_str!("../shaders/mesh.vert"),
            Self::MeshFrag => include_str!("../shaders/mesh.frag"),
            Self::ShadowVert => include_str!("../shaders/shadow.vert"),
        }
    }
}

/// Embedded SPIR-V shader bytecode (raw bytes, may not be aligned).
#[cfg(feature = "compile")]
mod spirv_bytes {
    pub static CULL: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/cull.spv"));
    pub static SKIN: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/skin.spv"));
    pub static MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh_vert.spv"));
    pub static MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh_frag.spv"));
    pub static SHADOW_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shadow_vert.spv"));
}

/// Convert bytes to SPIR-V words, checking alignment and the magic number.
pub fn spirv_from_bytes(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    let invalid = |reason: String| ShaderError::InvalidSpirv {
        name: name.to_string(),
        reason,
    };

    if bytes.len() % 4 != 0 {
        return Err(invalid(format!("length {} is not a multiple of 4", bytes.len())));
    }
    // Header is five words: magic, version, generator, bound, schema.
    if bytes.len() < 20 {
        return Err(invalid(format!("{} bytes is shorter than the header", bytes.len())));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(invalid(format!("bad magic number {:#010x}", words[0])));
    }
    Ok(words)
}

/// Where the renderer takes its SPIR-V from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ShaderSource {
    /// Bytecode embedded at build time.
    #[default]
    Embedded,
    /// A directory of `.spv` files.
    Directory(PathBuf),
}

impl ShaderSource {
    pub fn load(&self) -> Result<ShaderLibrary> {
        match self {
            Self::Embedded => ShaderLibrary::embedded(),
            Self::Directory(dir) => ShaderLibrary::from_dir(dir),
        }
    }
}

/// SPIR-V for every [`ShaderId`].
#[derive(Clone, Debug)]
pub struct ShaderLibrary {
    modules: [Vec<u32>; ShaderId::ALL.len()],
}

impl ShaderLibrary {
    /// Shaders compiled into the binary.
    #[cfg(feature = "compile")]
    pub fn embedded() -> Result<Self> {
        static EMBEDDED: OnceLock<ShaderLibrary> = OnceLock::new();

        if let Some(library) = EMBEDDED.get() {
            return Ok(library.clone());
        }
        let library = Self {
            modules: [
                spirv_from_bytes("cull.spv", spirv_bytes::CULL)?,
                spirv_from_bytes("skin.spv", spirv_bytes::SKIN)?,
                spirv_from_bytes("mesh_vert.spv", spirv_bytes::MESH_VERT)?,
                spirv_from_bytes("mesh_frag.spv", spirv_bytes::MESH_FRAG)?,
                spirv_from_bytes("shadow_vert.spv", spirv_bytes::SHADOW_VERT)?,
            ],
        };
        Ok(EMBEDDED.get_or_init(|| library).clone())
    }

    /// Shaders compiled into the binary.
    #[cfg(not(feature = "compile"))]
    pub fn embedded() -> Result<Self> {
        Err(ShaderError::NotEmbedded)
    }

    /// Load every shader from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut modules: [Vec<u32>; ShaderId::ALL.len()] = Default::default();
        for id in ShaderId::ALL {
            let path = dir.join(id.spirv_name());
            let bytes = std::fs::read(&path).map_err(|source| ShaderError::Io {
                path: path.clone(),
                source,
            })?;
            modules[id.index()] = spirv_from_bytes(id.spirv_name(), &bytes)?;
        }
        tracing::info!(dir = %dir.display(), "loaded SPIR-V shaders");
        Ok(Self { modules })
    }

    /// SPIR-V words of `id`.
    pub fn get(&self, id: ShaderId) -> &[u32] {
        &self.modules[id.index()]
    }
}
