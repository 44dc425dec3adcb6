//! Language capability registry.
//!
//! A static table describing, for each supported language, how it is
//! detected, which tools it needs inside the container, and how its build
//! and run commands are constructed.

use regex::Regex;
use serde::Serialize;
use std::path::Path;

/// How a language is turned into a running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Run the source file directly with an interpreter.
    Interpreter,
    /// Compile into the build directory, then run the artifact.
    CompileRun,
    /// Invoke a project script runner.
    Script,
}

/// Extra context a compile-run language needs before its run command can be
/// built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointRule {
    /// Name of the `public class` declared in the source, else the file stem.
    PublicClass,
}

/// Paths handed to build and run command builders. All are in-container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub source_path: String,
    pub build_dir: String,
    pub output_path: String,
    pub entry_point: Option<String>,
}

pub type CommandBuilder = fn(&BuildContext) -> Vec<String>;

/// How to detect, build, and run one language.
#[derive(Debug, Clone)]
pub struct Capability {
    pub id: &'static str,
    pub name: &'static str,
    pub mode: ExecutionMode,
    /// Runtime (and therefore image) the workspace container should use.
    pub runtime: &'static str,
    pub aliases: &'static [&'static str],
    pub extensions: &'static [&'static str],
    pub required_tools: &'static [&'static str],
    pub interpreter: &'static [&'static str],
    pub build_command: Option<CommandBuilder>,
    pub run_command: Option<CommandBuilder>,
    pub entry_point: Option<EntryPointRule>,
    pub script_runner: &'static [&'static str],
    pub default_script: Option<&'static str>,
    /// Program names recognized on a `#!` line.
    pub shebangs: &'static [&'static str],
    /// Root-level files whose presence in the workspace implies this language.
    pub manifests: &'static [&'static str],
}

impl Capability {
    fn interpreted(
        id: &'static str,
        name: &'static str,
        runtime: &'static str,
        interpreter: &'static [&'static str],
    ) -> Self {
        Self {
            id,
            name,
            mode: ExecutionMode::Interpreter,
            runtime,
            aliases: &[],
            extensions: &[],
            required_tools: &[],
            interpreter,
            build_command: None,
            run_command: None,
            entry_point: None,
            script_runner: &[],
            default_script: None,
            shebangs: &[],
            manifests: &[],
        }
    }

    fn compiled(
        id: &'static str,
        name: &'static str,
        runtime: &'static str,
        build: CommandBuilder,
        run: CommandBuilder,
    ) -> Self {
        Self {
            mode: ExecutionMode::CompileRun,
            interpreter: &[],
            build_command: Some(build),
            run_command: Some(run),
            ..Self::interpreted(id, name, runtime, &[])
        }
    }

    fn scripted(
        id: &'static str,
        name: &'static str,
        runtime: &'static str,
        runner: &'static [&'static str],
        default_script: &'static str,
    ) -> Self {
        Self {
            mode: ExecutionMode::Script,
            script_runner: runner,
            default_script: Some(default_script),
            ..Self::interpreted(id, name, runtime, &[])
        }
    }

    /// Interpreter invocation for a source file.
    pub fn interpreter_command(&self, source_path: &str) -> Vec<String> {
        let mut argv = to_owned(self.interpreter);
        argv.push(source_path.to_string());
        argv
    }

    /// Script runner invocation, using the default script unless overridden.
    pub fn script_command(&self, script: Option<&str>) -> Vec<String> {
        let mut argv = to_owned(self.script_runner);
        if let Some(script) = script.or(self.default_script) {
            argv.push(script.to_string());
        }
        argv
    }

    fn matches_name(&self, hint: &str) -> bool {
        let hint = hint.trim();
        self.id.eq_ignore_ascii_case(hint)
            || self.name.eq_ignore_ascii_case(hint)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(hint))
    }
}

fn to_owned(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Command Builders
// =============================================================================

fn go_build(ctx: &BuildContext) -> Vec<String> {
    to_owned(&["go", "build", "-o", ctx.output_path.as_str(), ctx.source_path.as_str()])
}

fn rust_build(ctx: &BuildContext) -> Vec<String> {
    to_owned(&["rustc", "-O", "-o", ctx.output_path.as_str(), ctx.source_path.as_str()])
}

fn c_build(ctx: &BuildContext) -> Vec<String> {
    to_owned(&["gcc", "-O2", "-o", ctx.output_path.as_str(), ctx.source_path.as_str(), "-lm"])
}

fn cpp_build(ctx: &BuildContext) -> Vec<String> {
    to_owned(&["g++", "-O2", "-std=c++17", "-o", ctx.output_path.as_str(), ctx.source_path.as_str()])
}

fn java_build(ctx: &BuildContext) -> Vec<String> {
    to_owned(&["javac", "-d", ctx.build_dir.as_str(), ctx.source_path.as_str()])
}

fn run_artifact(ctx: &BuildContext) -> Vec<String> {
    vec![ctx.output_path.clone()]
}

fn java_run(ctx: &BuildContext) -> Vec<String> {
    let class = ctx.entry_point.as_deref().unwrap_or("Main");
    to_owned(&["java", "-cp", ctx.build_dir.as_str(), class])
}

fn builtin_capabilities() -> Vec<Capability> {
    vec![
        Capability {
            aliases: &["py", "python3"],
            extensions: &["py"],
            required_tools: &["python3"],
            shebangs: &["python", "python3"],
            ..Capability::interpreted("python", "Python", "python", &["python3", "-u"])
        },
        Capability {
            aliases: &["js", "node", "nodejs"],
            extensions: &["js", "mjs", "cjs"],
            required_tools: &["node"],
            shebangs: &["node"],
            ..Capability::interpreted("javascript", "JavaScript", "node", &["node"])
        },
        Capability {
            aliases: &["ts"],
            extensions: &["ts"],
            required_tools: &["node", "ts-node"],
            shebangs: &["ts-node"],
            ..Capability::interpreted("typescript", "TypeScript", "node", &["ts-node"])
        },
        Capability {
            aliases: &["rb"],
            extensions: &["rb"],
            required_tools: &["ruby"],
            shebangs: &["ruby"],
            ..Capability::interpreted("ruby", "Ruby", "ruby", &["ruby"])
        },
        Capability {
            extensions: &["php"],
            required_tools: &["php"],
            shebangs: &["php"],
            ..Capability::interpreted("php", "PHP", "php", &["php"])
        },
        Capability {
            aliases: &["sh", "shell"],
            extensions: &["sh", "bash"],
            required_tools: &["bash"],
            shebangs: &["bash", "sh"],
            ..Capability::interpreted("bash", "Bash", "generic", &["bash"])
        },
        Capability {
            aliases: &["golang"],
            extensions: &["go"],
            required_tools: &["go"],
            ..Capability::compiled("go", "Go", "go", go_build, run_artifact)
        },
        Capability {
            aliases: &["rs"],
            extensions: &["rs"],
            required_tools: &["rustc"],
            ..Capability::compiled("rust", "Rust", "rust", rust_build, run_artifact)
        },
        Capability {
            extensions: &["c"],
            required_tools: &["gcc"],
            ..Capability::compiled("c", "C", "generic", c_build, run_artifact)
        },
        Capability {
            aliases: &["c++", "cxx"],
            extensions: &["cpp", "cc", "cxx"],
            required_tools: &["g++"],
            ..Capability::compiled("cpp", "C++", "generic", cpp_build, run_artifact)
        },
        Capability {
            extensions: &["java"],
            required_tools: &["javac", "java"],
            entry_point: Some(EntryPointRule::PublicClass),
            ..Capability::compiled("java", "Java", "java", java_build, java_run)
        },
        Capability {
            required_tools: &["npm"],
            manifests: &["package.json"],
            ..Capability::scripted("npm", "npm script", "node", &["npm", "run"], "start")
        },
        Capability {
            required_tools: &["cargo"],
            manifests: &["Cargo.toml"],
            ..Capability::scripted("cargo", "Cargo project", "rust", &["cargo"], "run")
        },
        Capability {
            aliases: &["makefile"],
            required_tools: &["make"],
            manifests: &["Makefile", "makefile"],
            ..Capability::scripted("make", "Make target", "generic", &["make"], "all")
        },
    ]
}

// =============================================================================
// Detection
// =============================================================================

/// Everything detection may look at.
#[derive(Debug, Clone, Default)]
pub struct DetectionContext<'a> {
    pub file_path: &'a str,
    pub content: Option<&'a str>,
    pub workspace_files: &'a [String],
    pub language_hint: Option<&'a str>,
}

/// Which detection tier produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionTier {
    Hint,
    Extension,
    Content,
    Manifest,
}

/// Registry of every language this engine can execute.
pub struct CapabilityRegistry {
    capabilities: Vec<Capability>,
    build_root: String,
    content_markers: Vec<(Regex, &'static str)>,
    public_class: Regex,
}

impl CapabilityRegistry {
    /// Create a registry of the built-in languages, placing build output
    /// under `build_root`.
    pub fn new(build_root: impl Into<String>) -> Self {
        // Checked in order; more specific markers first.
        let content_markers = vec![
            (Regex::new(r"^\s*<\?php").unwrap(), "php"),
            (Regex::new(r"(?m)^\s*package\s+main\b").unwrap(), "go"),
            (Regex::new(r"public\s+static\s+void\s+main\s*\(").unwrap(), "java"),
            (Regex::new(r"(?m)^\s*(pub\s+)?fn\s+main\s*\(").unwrap(), "rust"),
            (
                Regex::new(r"(?m)^\s*#include\s*<(iostream|vector|string|map)>|std::").unwrap(),
                "cpp",
            ),
            (Regex::new(r"(?m)^\s*#include\s*[<\x22]").unwrap(), "c"),
        ];

        Self {
            capabilities: builtin_capabilities(),
            build_root: build_root.into().trim_end_matches('/').to_string(),
            content_markers,
            public_class: Regex::new(r"public\s+(?:final\s+|abstract\s+)*class\s+([A-Za-z_][A-Za-z0-9_]*)")
                .unwrap(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.id == id)
    }

    /// Ids of every supported language, in registry order.
    pub fn supported_languages(&self) -> Vec<&'static str> {
        self.capabilities.iter().map(|c| c.id).collect()
    }

    /// Pick the capability for a file. First tier to match wins; `None` is
    /// terminal for the request.
    pub fn detect(&self, ctx: &DetectionContext<'_>) -> Option<&Capability> {
        self.detect_with_tier(ctx).map(|(cap, _)| cap)
    }

    pub fn detect_with_tier(&self, ctx: &DetectionContext<'_>) -> Option<(&Capability, DetectionTier)> {
        if let Some(hint) = ctx.language_hint.filter(|h| !h.trim().is_empty()) {
            if let Some(cap) = self.capabilities.iter().find(|c| c.matches_name(hint)) {
                return Some((cap, DetectionTier::Hint));
            }
        }

        if let Some(ext) = Path::new(ctx.file_path).extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if let Some(cap) = self
                .capabilities
                .iter()
                .find(|c| c.extensions.iter().any(|e| *e == ext))
            {
                return Some((cap, DetectionTier::Extension));
            }
        }

        if let Some(cap) = ctx.content.and_then(|content| self.detect_content(content)) {
            return Some((cap, DetectionTier::Content));
        }

        self.detect_manifest(ctx.file_path, ctx.workspace_files)
            .map(|cap| (cap, DetectionTier::Manifest))
    }

    fn detect_content(&self, content: &str) -> Option<&Capability> {
        if let Some(program) = shebang_program(content) {
            if let Some(cap) = self
                .capabilities
                .iter()
                .find(|c| c.shebangs.iter().any(|s| program_matches(program, s)))
            {
                return Some(cap);
            }
        }

        self.content_markers
            .iter()
            .find(|(pattern, _)| pattern.is_match(content))
            .and_then(|(_, id)| self.get(id))
    }

    fn detect_manifest(&self, file_path: &str, workspace_files: &[String]) -> Option<&Capability> {
        let target = file_path.trim_start_matches("./");
        let present = |manifest: &str| {
            target == manifest
                || workspace_files
                    .iter()
                    .any(|f| f.trim_start_matches("./") == manifest)
        };

        self.capabilities
            .iter()
            .find(|c| c.manifests.iter().any(|m| present(m)))
    }

    /// Entry point a run command needs, computed from source.
    pub fn resolve_entry_point(&self, cap: &Capability, file_path: &str, content: &str) -> Option<String> {
        match cap.entry_point? {
            EntryPointRule::PublicClass => Some(
                self.public_class
                    .captures(content)
                    .map(|c| c[1].to_string())
                    .unwrap_or_else(|| file_stem(file_path).to_string()),
            ),
        }
    }

    /// Deterministic in-container build directory for a workspace and language.
    pub fn build_dir_for(&self, workspace_id: &str, language_id: &str) -> String {
        format!("{}/{}/{}", self.build_root, workspace_id, language_id)
    }

    /// Deterministic artifact path for a source file.
    ///
    /// `src/main.go` and `main.go` map to different artifacts.
    pub fn output_path_for(&self, workspace_id: &str, language_id: &str, file_path: &str) -> String {
        let relative = file_path.trim_start_matches("./");
        let without_ext = match Path::new(relative).extension() {
            Some(ext) => &relative[..relative.len() - ext.len() - 1],
            None => relative,
        };
        format!(
            "{}/{}",
            self.build_dir_for(workspace_id, language_id),
            without_ext.replace('/', "_")
        )
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new("/tmp/devbox-build")
    }
}

/// Program named on a `#!` line, looking through `/usr/bin/env`.
fn shebang_program(content: &str) -> Option<&str> {
    let line = content.lines().next()?.strip_prefix("#!")?;
    let mut parts = line.split_whitespace();
    let mut program = parts.next()?.rsplit('/').next()?;
    if program == "env" {
        program = parts.find(|p| !p.starts_with('-'))?;
    }
    Some(program)
}

/// `python3.11` matches `python`; `bash` does not match `sh`.
fn program_matches(program: &str, name: &str) -> bool {
    program
        .strip_prefix(name)
        .map(|rest| rest.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .unwrap_or(false)
}

fn file_stem(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Main")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect_id(registry: &CapabilityRegistry, ctx: DetectionContext<'_>) -> Option<&'static str> {
        registry.detect(&ctx).map(|c| c.id)
    }

    #[test]
    fn test_hint_beats_extension() {
        let registry = CapabilityRegistry::default();
        let ctx = DetectionContext {
            file_path: "script.txt",
            language_hint: Some("Python"),
            ..Default::default()
        };
        assert_eq!(
            registry.detect_with_tier(&ctx).map(|(c, t)| (c.id, t)),
            Some(("python", DetectionTier::Hint))
        );

        let ctx = DetectionContext {
            file_path: "main.js",
            language_hint: Some("ts"),
            ..Default::default()
        };
        assert_eq!(detect_id(&registry, ctx), Some("typescript"));
    }

    #[test]
    fn test_unknown_hint_falls_through() {
        let registry = CapabilityRegistry::default();
        let ctx = DetectionContext {
            file_path: "main.go",
            language_hint: Some("cobol"),
            ..Default::default()
        };
        assert_eq!(detect_id(&registry, ctx), Some("go"));
    }

    #[test]
    fn test_extension_table() {
        let registry = CapabilityRegistry::default();
        for (path, id) in [
            ("a.py", "python"),
            ("src/app.MJS", "javascript"),
            ("x.rb", "ruby"),
            ("Main.java", "java"),
            ("lib.cc", "cpp"),
            ("prog.c", "c"),
            ("run.sh", "bash"),
        ] {
            let ctx = DetectionContext {
                file_path: path,
                ..Default::default()
            };
            assert_eq!(detect_id(&registry, ctx), Some(id), "{}", path);
        }
    }

    #[test]
    fn test_shebang_detection() {
        let registry = CapabilityRegistry::default();
        for (content, id) in [
            ("#!/usr/bin/env python3\nprint(1)", "python"),
            ("#!/usr/bin/python3.11\n", "python"),
            ("#!/bin/bash\necho hi", "bash"),
            ("#!/bin/sh\necho hi", "bash"),
            ("#!/usr/bin/env -S node --harmony\n", "javascript"),
        ] {
            let ctx = DetectionContext {
                file_path: "script",
                content: Some(content),
                ..Default::default()
            };
            assert_eq!(detect_id(&registry, ctx), Some(id), "{}", content);
        }
    }

    #[test]
    fn test_content_markers() {
        let registry = CapabilityRegistry::default();
        for (content, id) in [
            ("<?php echo 1;", "php"),
            ("package main\n\nfunc main() {}", "go"),
            ("fn main() {\n}", "rust"),
            ("class A { public static void main(String[] a) {} }", "java"),
            ("#include <iostream>\nint main(){}", "cpp"),
            ("#include <stdio.h>\nint main(){}", "c"),
        ] {
            let ctx = DetectionContext {
                file_path: "noext",
                content: Some(content),
                ..Default::default()
            };
            assert_eq!(detect_id(&registry, ctx), Some(id), "{}", content);
        }
    }

    #[test]
    fn test_manifest_detection() {
        let registry = CapabilityRegistry::default();
        let files = vec!["src/index".to_string(), "package.json".to_string()];
        let ctx = DetectionContext {
            file_path: "src/index",
            content: Some("just text"),
            workspace_files: &files,
            ..Default::default()
        };
        assert_eq!(
            registry.detect_with_tier(&ctx).map(|(c, t)| (c.id, t)),
            Some(("npm", DetectionTier::Manifest))
        );

        // Nested manifests do not count.
        let files = vec!["vendor/lib/package.json".to_string()];
        let ctx = DetectionContext {
            file_path: "notes",
            workspace_files: &files,
            ..Default::default()
        };
        assert!(registry.detect(&ctx).is_none());
    }

    #[test]
    fn test_nothing_matches() {
        let registry = CapabilityRegistry::default();
        let ctx = DetectionContext {
            file_path: "data.xyz",
            content: Some("plain words"),
            ..Default::default()
        };
        assert!(registry.detect(&ctx).is_none());
    }

    #[test]
    fn test_headers_are_not_runnable() {
        let registry = CapabilityRegistry::default();
        let ctx = DetectionContext {
            file_path: "include/math.hpp",
            content: Some("#pragma once\nint add(int a, int b);\n"),
            ..Default::default()
        };
        assert!(registry.detect(&ctx).is_none());
    }

    #[test]
    fn test_paths_are_deterministic() {
        let registry = CapabilityRegistry::new("/tmp/build/");
        assert_eq!(registry.build_dir_for("ws1", "go"), "/tmp/build/ws1/go");
        assert_eq!(
            registry.output_path_for("ws1", "go", "src/main.go"),
            "/tmp/build/ws1/go/src_main"
        );
        assert_eq!(
            registry.output_path_for("ws1", "go", "./main.go"),
            "/tmp/build/ws1/go/main"
        );
        assert_eq!(
            registry.output_path_for("ws1", "go", "src/main.go"),
            registry.output_path_for("ws1", "go", "src/main.go")
        );
    }

    #[test]
    fn test_java_entry_point() {
        let registry = CapabilityRegistry::default();
        let java = registry.get("java").unwrap();
        assert_eq!(
            registry.resolve_entry_point(java, "src/App.java", "public final class Hello {}"),
            Some("Hello".to_string())
        );
        assert_eq!(
            registry.resolve_entry_point(java, "src/App.java", "class Hidden {}"),
            Some("App".to_string())
        );
        let go = registry.get("go").unwrap();
        assert_eq!(registry.resolve_entry_point(go, "main.go", ""), None);
    }

    #[test]
    fn test_command_builders() {
        let registry = CapabilityRegistry::default();
        let ctx = BuildContext {
            source_path: "/workspace/Main.java".into(),
            build_dir: "/tmp/b".into(),
            output_path: "/tmp/b/Main".into(),
            entry_point: Some("Main".into()),
        };
        let java = registry.get("java").unwrap();
        assert_eq!(
            (java.build_command.unwrap())(&ctx),
            vec!["javac", "-d", "/tmp/b", "/workspace/Main.java"]
        );
        assert_eq!(
            (java.run_command.unwrap())(&ctx),
            vec!["java", "-cp", "/tmp/b", "Main"]
        );

        let python = registry.get("python").unwrap();
        assert_eq!(
            python.interpreter_command("/workspace/a.py"),
            vec!["python3", "-u", "/workspace/a.py"]
        );

        let npm = registry.get("npm").unwrap();
        assert_eq!(npm.script_command(None), vec!["npm", "run", "start"]);
        assert_eq!(npm.script_command(Some("test")), vec!["npm", "run", "test"]);
    }
}
