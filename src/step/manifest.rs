//! Steps described by a TOML manifest that wraps one external command.
//!
//! ```toml
//! name = "initrd/dracut"
//! description = "Build an initrd with dracut"
//! optional_config = ["DracutConf"]
//! options = { DracutConf = "file" }
//! command = ["dracut", "--conf", "{config.DracutConf}", "{output}", "{kver}"]
//! produces = "initrd"
//! output = "initrd.img"
//! ```
//!
//! An argument referring to an optional input or setting that is not bound
//! is dropped from the command line.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::artifact::{Artifact, ArtifactKind, KindQuery};
use crate::error::{Error, Result};
use crate::step::{OptionType, Step, StepContext, StepDescriptor, StepOutput};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, OptionType>,
    #[serde(default)]
    required_config: BTreeSet<String>,
    #[serde(default)]
    optional_config: BTreeSet<String>,
    #[serde(default)]
    required_inputs: BTreeSet<String>,
    #[serde(default)]
    optional_inputs: BTreeSet<String>,
    command: Vec<String>,
    #[serde(default)]
    produces: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Kver,
    Chain,
    Output,
    Input(String),
    Config(String),
}

type Template = Vec<Segment>;

#[derive(Debug)]
pub struct ManifestStep {
    descriptor: StepDescriptor,
    program: String,
    args: Vec<Template>,
    produces: Option<(ArtifactKind, String)>,
    installed: bool,
}

impl ManifestStep {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&content).map_err(|e| match e {
            Error::InvalidModule { name, reason } if name.is_empty() => {
                Error::invalid_module(path.display().to_string(), reason)
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| Error::invalid_module("", e.to_string()))?;
        let name = manifest.name.clone();
        let invalid = |reason: String| Error::invalid_module(&name, reason);

        let mut descriptor = StepDescriptor::new(&manifest.name)
            .requires_config(manifest.required_config)
            .accepts_config(manifest.optional_config)
            .requires_inputs(manifest.required_inputs)
            .accepts_inputs(manifest.optional_inputs);
        descriptor.description = manifest.description;
        descriptor.options = manifest.options;

        let mut command = manifest.command.into_iter();
        let program = command
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| invalid("'command' must name a program".into()))?;
        if program.contains('{') {
            return Err(invalid("the program name cannot be templated".into()));
        }
        descriptor.required_tools.push(program.clone());

        let args = command
            .map(|arg| parse_template(&arg).map_err(invalid))
            .collect::<Result<Vec<_>>>()?;

        let produces = match (manifest.produces, manifest.output) {
            (Some(kind), Some(output)) => Some((produced_kind(&kind).map_err(invalid)?, output)),
            (None, None) => None,
            (Some(_), None) => return Err(invalid("'produces' requires 'output'".into())),
            (None, Some(_)) => return Err(invalid("'output' requires 'produces'".into())),
        };
        if manifest.installed && produces.is_none() {
            return Err(invalid("'installed' requires 'produces'".into()));
        }

        for segment in args.iter().flatten() {
            match segment {
                Segment::Output if produces.is_none() => {
                    return Err(invalid("'{output}' used without 'output'".into()));
                }
                Segment::Input(input)
                    if !descriptor.required_inputs.contains(input)
                        && !descriptor.optional_inputs.contains(input) =>
                {
                    return Err(invalid(format!("'{{input.{input}}}' is not a declared input")));
                }
                Segment::Config(key)
                    if !descriptor.required_config.contains(key)
                        && !descriptor.optional_config.contains(key) =>
                {
                    return Err(invalid(format!("'{{config.{key}}}' is not a declared setting")));
                }
                _ => {}
            }
        }

        Ok(Self {
            descriptor,
            program,
            args,
            produces,
            installed: manifest.installed,
        })
    }

    /// `None` when the argument refers to an unbound optional value.
    fn render(&self, template: &Template, ctx: &StepContext<'_>) -> Option<String> {
        let mut out = String::new();
        for segment in template {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Kver => out.push_str(ctx.kver()),
                Segment::Chain => out.push_str(ctx.chain_name()),
                Segment::Output => {
                    let (_, output) = self.produces.as_ref()?;
                    out.push_str(&ctx.resolve(output).to_string_lossy());
                }
                Segment::Input(name) => {
                    out.push_str(&ctx.input(name)?.path.to_string_lossy());
                }
                Segment::Config(key) => out.push_str(&ctx.setting(key)?.to_string()),
            }
        }
        Some(out)
    }
}

impl Step for ManifestStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let args: Vec<String> = self
            .args
            .iter()
            .filter_map(|template| self.render(template, ctx))
            .collect();
        ctx.command(&self.program).args(&args).run()?;

        let Some((kind, output)) = &self.produces else {
            return Ok(StepOutput::Nothing);
        };
        let path = ctx.resolve(output);
        if !path.exists() {
            return Err(Error::execution(
                ctx.step_name(),
                format!("`{}` did not create '{}'", self.program, path.display()),
            ));
        }
        let artifact: Artifact = ctx.artifact(*kind, path).with_installed(self.installed);
        Ok(artifact.into())
    }
}

fn produced_kind(name: &str) -> std::result::Result<ArtifactKind, String> {
    match name.parse::<KindQuery>().map_err(|e| e.to_string())? {
        KindQuery::Exact(kind) => Ok(kind),
        KindQuery::AnyFile => Ok(ArtifactKind::File),
        KindQuery::Signable => Err("'produces' must name a concrete kind".into()),
    }
}

fn parse_template(arg: &str) -> std::result::Result<Template, String> {
    let mut segments = Vec::new();
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{arg}'"))?;
        segments.push(placeholder(&after[..end])?);
        rest = &after[end + 1..];
    }
    if rest.contains('}') {
        return Err(format!("unmatched '}}' in '{arg}'"));
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    Ok(segments)
}

fn placeholder(name: &str) -> std::result::Result<Segment, String> {
    match name {
        "kver" => Ok(Segment::Kver),
        "chain" => Ok(Segment::Chain),
        "output" => Ok(Segment::Output),
        _ => {
            if let Some(kind) = name.strip_prefix("input.") {
                Ok(Segment::Input(kind.to_string()))
            } else if let Some(key) = name.strip_prefix("config.") {
                Ok(Segment::Config(key.to_string()))
            } else {
                Err(format!("unknown placeholder '{{{name}}}'"))
            }
        }
    }
}
