//! Operator commands for managing the language catalog.
//!
//! Adding a language is a config-plus-image change: append a profile to
//! `config/languages.json`, render its Dockerfile, build the pinned image.
//! No code change is ever required per language.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crucible_common::profiles::{DenyRule, LanguageProfile, NetworkPolicy};

const CATALOG_PATH: &str = "config/languages.json";
const DOCKERFILE_TEMPLATE: &str = "templates/Dockerfile.hbs";

#[derive(Debug, Serialize, Deserialize)]
struct CatalogFile {
    languages: Vec<LanguageProfile>,
}

fn load_catalog() -> Result<CatalogFile> {
    let path = Path::new(CATALOG_PATH);
    if !path.exists() {
        return Ok(CatalogFile {
            languages: Vec::new(),
        });
    }
    let content = fs::read_to_string(path).context("failed to read languages.json")?;
    serde_json::from_str(&content).context("failed to parse languages.json")
}

fn save_catalog(catalog: &CatalogFile) -> Result<()> {
    let path = Path::new(CATALOG_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content =
        serde_json::to_string_pretty(catalog).context("failed to serialize languages.json")?;
    fs::write(path, content).context("failed to write languages.json")
}

/// Conservative starter denylist for a new language. Operators are
/// expected to refine it; the container remains the security boundary
/// either way.
fn default_denylist(name: &str) -> Vec<DenyRule> {
    let rule = |category: &str, pattern: &str| DenyRule {
        category: category.to_string(),
        pattern: pattern.to_string(),
    };

    match name {
        "python" => vec![
            rule("process_spawn", r"\b(?:import\s+(?:subprocess|pty)|os\.system)"),
            rule("raw_sockets", r"\bimport\s+socket\b"),
            rule("dynamic_eval", r"\b(?:eval|exec)\s*\(|__import__"),
        ],
        "javascript" | "node" => vec![
            rule("process_spawn", r"child_process"),
            rule("raw_sockets", r#"require\s*\(\s*['"](?:net|dgram)['"]\s*\)"#),
            rule("dynamic_eval", r"\beval\s*\(|new\s+Function\s*\("),
        ],
        _ => vec![
            rule("process_spawn", r"\b(?:system|popen|exec[lvpe]{0,2}|fork)\s*\("),
            rule("raw_sockets", r"\bsocket\s*\("),
        ],
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn add_language(
    name: &str,
    ext: &str,
    version: &str,
    base_image: Option<&str>,
    run: Option<&str>,
    compile: Option<&str>,
    memory: u64,
    cpus: f64,
    timeout_ms: u64,
    build_docker: bool,
) -> Result<()> {
    let mut catalog = load_catalog()?;
    if catalog.languages.iter().any(|l| l.id == name) {
        bail!("language '{name}' already exists in {CATALOG_PATH}");
    }

    let image = format!("crucible-{name}:{version}");
    let base_image = base_image
        .map(str::to_string)
        .unwrap_or_else(|| format!("{name}:{version}"));
    let run_command = run
        .map(str::to_string)
        .unwrap_or_else(|| format!("{name} main.{ext}"));

    let profile = LanguageProfile {
        id: name.to_string(),
        display_name: name.to_string(),
        version: version.to_string(),
        image: image.clone(),
        file_extension: ext.to_string(),
        compile_command: compile.map(str::to_string),
        run_command,
        default_timeout_ms: timeout_ms,
        max_memory_mb: memory,
        max_cpus: cpus,
        max_cpu_time_s: (timeout_ms / 1000).max(1),
        network_policy: NetworkPolicy::Deny,
        supports_stdin: true,
        max_output_bytes: 1024 * 1024,
        pids_limit: 64,
        denylist: default_denylist(name),
    };

    render_dockerfile(name, version, &base_image)?;

    catalog.languages.push(profile);
    save_catalog(&catalog)?;

    println!("Added language '{name}' to {CATALOG_PATH}");
    println!("  image: {image}");
    println!("  dockerfile: docker/{name}/Dockerfile");

    if build_docker {
        build_docker_image(name, false).await?;
    } else {
        println!("Run `crucible-cli build-image --name {name}` to build the image.");
    }

    Ok(())
}

fn render_dockerfile(name: &str, version: &str, base_image: &str) -> Result<()> {
    let template = fs::read_to_string(DOCKERFILE_TEMPLATE)
        .with_context(|| format!("failed to read {DOCKERFILE_TEMPLATE}"))?;

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars
        .register_template_string("dockerfile", template)
        .context("invalid Dockerfile template")?;

    let rendered = handlebars.render(
        "dockerfile",
        &serde_json::json!({
            "base_image": base_image,
            "language": name,
            "version": version,
        }),
    )?;

    let dir = format!("docker/{name}");
    fs::create_dir_all(&dir)?;
    fs::write(format!("{dir}/Dockerfile"), rendered)
        .context("failed to write Dockerfile")?;
    Ok(())
}

pub async fn build_docker_image(name: &str, no_cache: bool) -> Result<()> {
    let catalog = load_catalog()?;
    let profile = catalog
        .languages
        .iter()
        .find(|l| l.id == name)
        .with_context(|| format!("language '{name}' not found in {CATALOG_PATH}"))?;

    let dockerfile = format!("docker/{name}/Dockerfile");
    if !Path::new(&dockerfile).exists() {
        bail!("missing {dockerfile}; run add-lang first");
    }

    println!("Building image {} from {dockerfile}...", profile.image);

    let mut cmd = Command::new("docker");
    cmd.arg("build")
        .arg("-f")
        .arg(&dockerfile)
        .arg("-t")
        .arg(&profile.image)
        .arg(".")
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if no_cache {
        cmd.arg("--no-cache");
    }

    let status = cmd.status().context("failed to run docker build")?;
    if !status.success() {
        bail!("docker build failed for '{name}'");
    }

    println!("Image {} built.", profile.image);
    Ok(())
}

pub async fn init_project(path: &str) -> Result<()> {
    let root = Path::new(path);
    for dir in ["config", "docker", "templates"] {
        fs::create_dir_all(root.join(dir))?;
    }

    let catalog_path = root.join(CATALOG_PATH);
    if !catalog_path.exists() {
        let starter = CatalogFile {
            languages: vec![LanguageProfile {
                id: "python".to_string(),
                display_name: "Python".to_string(),
                version: "3.12".to_string(),
                image: "crucible-python:3.12".to_string(),
                file_extension: "py".to_string(),
                compile_command: None,
                run_command: "python3 -u main.py".to_string(),
                default_timeout_ms: 10_000,
                max_memory_mb: 128,
                max_cpus: 1.0,
                max_cpu_time_s: 10,
                network_policy: NetworkPolicy::Deny,
                supports_stdin: true,
                max_output_bytes: 1024 * 1024,
                pids_limit: 64,
                denylist: default_denylist("python"),
            }],
        };
        let content = serde_json::to_string_pretty(&starter)?;
        fs::write(&catalog_path, content)?;
        println!("Wrote starter catalog to {}", catalog_path.display());
    }

    let template_path = root.join(DOCKERFILE_TEMPLATE);
    if !template_path.exists() {
        fs::write(
            &template_path,
            include_str!("../../../templates/Dockerfile.hbs"),
        )?;
        println!("Wrote Dockerfile template to {}", template_path.display());
    }

    println!("Project initialized at {}", root.display());
    Ok(())
}
