//! Build script compiling the GLSL shaders to SPIR-V when the `compile`
//! feature is enabled.

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    #[cfg(feature = "compile")]
    compile::all();
}

#[cfg(feature = "compile")]
mod compile {
    use shaderc::{CompileOptions, Compiler, IncludeType, ResolvedInclude, ShaderKind};
    use std::env;
    use std::fs;
    use std::path::{Path, PathBuf};

    const SHADERS: [(&str, &str, ShaderKind); 5] = [
        ("cull.comp", "cull.spv", ShaderKind::Compute),
        ("skin.comp", "skin.spv", ShaderKind::Compute),
        ("mesh.vert", "mesh_vert.spv", ShaderKind::Vertex),
        ("mesh.frag", "mesh_frag.spv", ShaderKind::Fragment),
        ("shadow.vert", "shadow_vert.spv", ShaderKind::Vertex),
    ];

    pub fn all() {
        let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
        let shader_dir = Path::new("shaders");
        let compiler = Compiler::new().expect("Failed to create shader compiler");

        for (source, output, kind) in SHADERS {
            compile_shader(
                &compiler,
                shader_dir,
                shader_dir.join(source),
                out_dir.join(output),
                kind,
            );
        }
    }

    fn compile_shader(
        compiler: &Compiler,
        include_dir: &Path,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        kind: ShaderKind,
    ) {
        let input_path = input.as_ref();
        let output_path = output.as_ref();

        let source = fs::read_to_string(input_path)
            .unwrap_or_else(|e| panic!("Failed to read shader {input_path:?}: {e}"));
        let file_name = input_path.file_name().unwrap().to_str().unwrap();

        let mut options = CompileOptions::new().expect("Failed to create compile options");
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        options.set_target_spirv(shaderc::SpirvVersion::V1_6);
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);

        let include_dir = include_dir.to_path_buf();
        options.set_include_callback(move |requested, _kind: IncludeType, _from, _depth| {
            let path = include_dir.join(requested);
            let content = fs::read_to_string(&path)
                .map_err(|e| format!("cannot include {}: {e}", path.display()))?;
            Ok(ResolvedInclude {
                resolved_name: path.display().to_string(),
                content,
            })
        });

        let result = compiler
            .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
            .unwrap_or_else(|e| panic!("Failed to compile shader {input_path:?}: {e}"));

        if result.get_num_warnings() > 0 {
            println!(
                "cargo:warning=Shader warnings in {input_path:?}: {}",
                result.get_warning_messages()
            );
        }

        fs::write(output_path, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
            .unwrap_or_else(|e| panic!("Failed to write shader {output_path:?}: {e}"));
    }
}
