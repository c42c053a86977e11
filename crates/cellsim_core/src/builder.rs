//! Building kernels from source text.
//!
//! Every build gets a fresh scratch directory and a module name that is unique
//! for the lifetime of the process, so kernels of simulations that are alive
//! at the same time never collide. The scratch directory is removed when the
//! build finishes, whether it succeeded or not. Toolchains receive the
//! scratch directory as an explicit working directory; the working directory
//! of the process is never changed.
//!
//! Built kernels can be persisted in an archive (bincode + zstd) together with
//! the model, protocols and sensitivity specification they were built for,
//! and loaded again later without rebuilding. Archives are tied to the
//! platform that wrote them.

use crate::error::{ArchiveError, CompilationError, Error, Result};
use crate::kernel::{Kernel, KernelProgram, VmKernel, PROGRAM_FORMAT};
use crate::model::{Model, SensitivitySpec};
use crate::protocol::PacingProtocol;
use crate::source::{read_kernel_source, render, MODULE_NAME_KEY};
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Archive format version (increment on breaking changes).
pub const ARCHIVE_VERSION: u32 = 1;

/// zstd level used for archives.
pub const ARCHIVE_COMPRESSION_LEVEL: i32 = 3;

const MAX_INCLUDE_DEPTH: usize = 16;

static NEXT_MODULE: AtomicUsize = AtomicUsize::new(0);

/// Returns `<prefix>_<pid>_<counter>`; never the same twice in one process.
pub fn unique_module_name(prefix: &str) -> String {
    let counter = NEXT_MODULE.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{counter}", sanitize(prefix), std::process::id())
}

fn sanitize(prefix: &str) -> String {
    let cleaned: String = prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "kernel".to_string()
    } else {
        cleaned
    }
}

/// Extra inputs handed to the toolchain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub libs: Vec<String>,
    pub lib_dirs: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub compile_args: Vec<String>,
    pub link_args: Vec<String>,
}

/// One toolchain invocation.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub module: &'a str,
    /// Scratch directory; the toolchain runs here.
    pub work_dir: &'a Path,
    pub source: &'a Path,
    /// Where the serialized [`KernelProgram`] must be written.
    pub output: &'a Path,
    pub options: &'a BuildOptions,
}

/// Turns a rendered kernel source into a program artifact.
pub trait Toolchain: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Runs the build. Anything the toolchain prints goes to `output`, which
    /// ends up in the [`CompilationError`] if the build fails.
    fn build(&self, request: &BuildRequest<'_>, output: &mut String) -> anyhow::Result<()>;
}

/// In-process toolchain: parses the source and compiles it to bytecode.
///
/// Understands `-O0` (no constant folding) and `-O1`..`-O3` (folding, the
/// default). Lines of the form `include "file"` are replaced by the file's
/// contents, searched for in the scratch directory and then `include_dirs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytecodeToolchain;

impl BytecodeToolchain {
    fn fold_constants(args: &[String], output: &mut String) -> bool {
        let mut fold = true;
        for arg in args {
            match arg.as_str() {
                "-O0" => fold = false,
                "-O1" | "-O2" | "-O3" => fold = true,
                other => {
                    output.push_str(&format!("warning: ignoring unsupported argument {other}\n"));
                }
            }
        }
        fold
    }

    fn expand_includes(
        text: &str,
        work_dir: &Path,
        include_dirs: &[PathBuf],
        depth: usize,
    ) -> anyhow::Result<String> {
        if depth > MAX_INCLUDE_DEPTH {
            bail!("includes nested more than {MAX_INCLUDE_DEPTH} levels deep");
        }
        let mut expanded = String::with_capacity(text.len());
        for line in text.lines() {
            let Some(rest) = line.trim().strip_prefix("include ") else {
                expanded.push_str(line);
                expanded.push('\n');
                continue;
            };
            let file = rest
                .trim()
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .ok_or_else(|| anyhow!("malformed include {rest}"))?;
            let path = std::iter::once(work_dir)
                .chain(include_dirs.iter().map(PathBuf::as_path))
                .map(|dir| dir.join(file))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| anyhow!("include file \"{file}\" not found"))?;
            let included = fs::read_to_string(&path)
                .with_context(|| format!("reading include {}", path.display()))?;
            expanded.push_str(&Self::expand_includes(&included, work_dir, include_dirs, depth + 1)?);
        }
        Ok(expanded)
    }
}

impl Toolchain for BytecodeToolchain {
    fn name(&self) -> &str {
        "bytecode"
    }

    fn build(&self, request: &BuildRequest<'_>, output: &mut String) -> anyhow::Result<()> {
        let options = request.options;
        let fold = Self::fold_constants(&options.compile_args, output);
        if !options.libs.is_empty() || !options.link_args.is_empty() {
            output.push_str("note: bytecode kernels are not linked; libraries are ignored\n");
        }

        let text = fs::read_to_string(request.source)
            .with_context(|| format!("reading {}", request.source.display()))?;
        let text = Self::expand_includes(&text, request.work_dir, &options.include_dirs, 0)?;
        let source = read_kernel_source(&text)?;
        if source.module != request.module {
            bail!(
                "source declares kernel {} but {} was requested",
                source.module,
                request.module
            );
        }
        let program = KernelProgram::compile(&source, fold)?;
        let bytes = bincode::serialize(&program).context("serializing program")?;
        fs::write(request.output, &bytes)
            .with_context(|| format!("writing {}", request.output.display()))?;
        output.push_str(&format!(
            "compiled {} ({} states, {} intermediates, {} bytes)\n",
            request.module,
            program.state_count(),
            program.intermediates.len(),
            bytes.len()
        ));
        Ok(())
    }
}

/// Runs an external program that writes the artifact.
///
/// The command line is `program [args] [compile_args] -I<dir>.. -o <output>
/// <source> -L<dir>.. -l<lib>.. [link_args]`, run inside the scratch
/// directory with `CELLSIM_MODULE` set to the module name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandToolchain {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandToolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self, request: &BuildRequest<'_>) -> Command {
        let options = request.options;
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(request.work_dir)
            .env("CELLSIM_MODULE", request.module)
            .args(&self.args)
            .args(&options.compile_args);
        for dir in &options.include_dirs {
            cmd.arg(format!("-I{}", dir.display()));
        }
        cmd.arg("-o").arg(request.output).arg(request.source);
        for dir in &options.lib_dirs {
            cmd.arg(format!("-L{}", dir.display()));
        }
        for lib in &options.libs {
            cmd.arg(format!("-l{lib}"));
        }
        cmd.args(&options.link_args);
        cmd
    }
}

impl Toolchain for CommandToolchain {
    fn name(&self) -> &str {
        self.program.to_str().unwrap_or("external")
    }

    fn build(&self, request: &BuildRequest<'_>, output: &mut String) -> anyhow::Result<()> {
        let result = self
            .command(request)
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        output.push_str(&String::from_utf8_lossy(&result.stdout));
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        if !result.status.success() {
            bail!("{} exited with {}", self.program.display(), result.status);
        }
        if !request.output.is_file() {
            bail!("{} produced no artifact", self.program.display());
        }
        Ok(())
    }
}

/// A freshly built kernel with the inputs needed to persist it.
pub struct BuiltKernel {
    pub kernel: VmKernel,
    pub source: String,
    pub artifact: Vec<u8>,
}

impl std::fmt::Debug for BuiltKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltKernel")
            .field("kernel", &self.kernel.name())
            .field("source_len", &self.source.len())
            .field("artifact_len", &self.artifact.len())
            .finish()
    }
}

/// Builds kernels with a toolchain inside scratch directories.
pub struct KernelBuilder {
    toolchain: Box<dyn Toolchain>,
    options: BuildOptions,
    scratch_root: Option<PathBuf>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new(BytecodeToolchain)
    }
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("toolchain", &self.toolchain.name())
            .field("options", &self.options)
            .field("scratch_root", &self.scratch_root)
            .finish()
    }
}

impl KernelBuilder {
    pub fn new(toolchain: impl Toolchain + 'static) -> Self {
        Self {
            toolchain: Box::new(toolchain),
            options: BuildOptions::default(),
            scratch_root: None,
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Creates scratch directories under `root` instead of the system
    /// temporary directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Renders `template` with `module_name` set to `module`, without
    /// building anything.
    pub fn render_only(
        &self,
        module: &str,
        template: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut vars = vars.clone();
        vars.insert(MODULE_NAME_KEY.to_string(), module.to_string());
        Ok(render(template, &vars)?)
    }

    /// Renders and builds a kernel under a new unique name derived from
    /// `name`, then loads the artifact.
    pub fn compile(
        &self,
        name: &str,
        template: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<BuiltKernel> {
        let module = unique_module_name(name);
        let source = self.render_only(&module, template, vars)?;
        let started = Instant::now();

        let scratch = match &self.scratch_root {
            Some(root) => tempfile::Builder::new().prefix("cellsim-").tempdir_in(root),
            None => tempfile::Builder::new().prefix("cellsim-").tempdir(),
        }
        .map_err(|err| CompilationError::new(&module, "", format!("cannot create scratch directory: {err}")))?;
        debug!(module = %module, dir = %scratch.path().display(), toolchain = self.toolchain.name(), "building kernel");

        let source_path = scratch.path().join(format!("{module}.kernel"));
        let output_path = scratch.path().join(format!("{module}.bin"));
        let mut output = String::new();
        let built = fs::write(&source_path, &source)
            .with_context(|| format!("writing {}", source_path.display()))
            .and_then(|()| {
                let request = BuildRequest {
                    module: &module,
                    work_dir: scratch.path(),
                    source: &source_path,
                    output: &output_path,
                    options: &self.options,
                };
                self.toolchain.build(&request, &mut output)
            })
            .and_then(|()| {
                fs::read(&output_path).with_context(|| format!("reading {}", output_path.display()))
            })
            .and_then(|artifact| {
                let program = load_program(&artifact, &module)?;
                Ok((program, artifact))
            });

        let path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            warn!(dir = %path.display(), error = %err, "failed to remove scratch directory");
        }

        let (program, artifact) = built.map_err(|err| {
            warn!(module = %module, error = %format!("{err:#}"), "kernel build failed");
            Error::from(CompilationError::new(&module, output.as_str(), format!("{err:#}")))
        })?;
        info!(
            module = %module,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "kernel built"
        );
        Ok(BuiltKernel {
            kernel: VmKernel::new(program),
            source,
            artifact,
        })
    }
}

impl KernelBuilder {
    /// Writes a built kernel and the configuration it was built for to an
    /// archive at `path`.
    pub fn persist(
        path: &Path,
        metadata: ArchiveMetadata,
        source: &str,
        artifact: &[u8],
    ) -> std::result::Result<(), ArchiveError> {
        KernelArchive::new(metadata, source.to_string(), artifact.to_vec()).write(path)
    }

    /// Reads an archive and loads its kernel without rebuilding.
    pub fn load_archive(path: &Path) -> std::result::Result<(KernelArchive, VmKernel), ArchiveError> {
        let archive = KernelArchive::read(path)?;
        let kernel = archive.kernel()?;
        if kernel.name() != archive.metadata.name {
            return Err(ArchiveError::Incompatible(format!(
                "archive {} contains kernel {}",
                archive.metadata.name,
                kernel.name()
            )));
        }
        Ok((archive, kernel))
    }
}

fn load_program(artifact: &[u8], module: &str) -> anyhow::Result<KernelProgram> {
    let program: KernelProgram = bincode::deserialize(artifact).context("artifact is not a kernel program")?;
    if program.format != PROGRAM_FORMAT {
        bail!(
            "artifact format {} is not supported (expected {PROGRAM_FORMAT})",
            program.format
        );
    }
    if program.module != module {
        bail!("artifact contains kernel {} instead of {module}", program.module);
    }
    Ok(program)
}

/// Identifies an archive and the platform it was written on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    pub version: u32,
    pub os: String,
    pub arch: String,
    pub created_at: SystemTime,
}

impl ArchiveHeader {
    fn current() -> Self {
        Self {
            version: ARCHIVE_VERSION,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            created_at: SystemTime::now(),
        }
    }
}

/// Static configuration a kernel was built for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub name: String,
    pub model: Model,
    pub protocols: BTreeMap<String, Option<PacingProtocol>>,
    pub sensitivities: Option<SensitivitySpec>,
    pub options: BuildOptions,
}

/// A persisted kernel: the artifact, its source and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelArchive {
    pub header: ArchiveHeader,
    pub metadata: ArchiveMetadata,
    pub source: String,
    pub artifact: Vec<u8>,
}

impl KernelArchive {
    pub fn new(metadata: ArchiveMetadata, source: String, artifact: Vec<u8>) -> Self {
        Self {
            header: ArchiveHeader::current(),
            metadata,
            source,
            artifact,
        }
    }

    /// Loads the archived kernel.
    pub fn kernel(&self) -> std::result::Result<VmKernel, ArchiveError> {
        let program: KernelProgram = bincode::deserialize(&self.artifact)?;
        if program.format != PROGRAM_FORMAT {
            return Err(ArchiveError::Incompatible(format!(
                "kernel program format {} (expected {PROGRAM_FORMAT})",
                program.format
            )));
        }
        Ok(VmKernel::new(program))
    }

    /// Writes the archive to `path`.
    pub fn write(&self, path: &Path) -> std::result::Result<(), ArchiveError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let serialized = bincode::serialize(self)?;
        let compressed = zstd::encode_all(&serialized[..], ARCHIVE_COMPRESSION_LEVEL)?;
        fs::write(path, &compressed)?;
        info!(
            path = %path.display(),
            name = %self.metadata.name,
            bytes = compressed.len(),
            "kernel archive written"
        );
        Ok(())
    }

    /// Reads an archive, refusing ones from another version or platform.
    pub fn read(path: &Path) -> std::result::Result<Self, ArchiveError> {
        let compressed = fs::read(path)?;
        let serialized = zstd::decode_all(&compressed[..])?;
        let archive: KernelArchive = bincode::deserialize(&serialized)?;
        let header = &archive.header;
        if header.version != ARCHIVE_VERSION {
            return Err(ArchiveError::Incompatible(format!(
                "archive version {} (expected {ARCHIVE_VERSION})",
                header.version
            )));
        }
        if header.os != std::env::consts::OS || header.arch != std::env::consts::ARCH {
            return Err(ArchiveError::Incompatible(format!(
                "archive was built for {}-{}, this is {}-{}",
                header.os,
                header.arch,
                std::env::consts::OS,
                std::env::consts::ARCH
            )));
        }
        debug!(path = %path.display(), name = %archive.metadata.name, "kernel archive read");
        Ok(archive)
    }
}
