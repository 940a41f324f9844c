// ABOUTME: Capability API handed to template scripts
// ABOUTME: Template, image and container handles that accumulate into one owned TemplateModel

use super::executor::ImportScope;
use super::helpers::{
    format_verbs, ints, map_to_json, parse_interval, scalar_to_string, strings, types_module,
    FnResult, Opts,
};
use super::loader::{normalize_path, DataSource};
use crate::error::{EngineError, ModelError};
use crate::model::{
    CheckKind, CheckSpec, ContainerDecl, ImageDecl, ImageSource, Mount, TemplateModel,
    Workspace, WorkspaceFile, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_LIMIT,
};
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Map, INT};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// State shared by every handle of one template execution
pub(crate) struct Session {
    template: String,
    data: Arc<dyn DataSource>,
    model: RefCell<TemplateModel>,
    /// Typed errors raised through the script, keyed by their message
    raised: RefCell<Vec<(String, EngineError)>>,
    imports: ImportScope,
}

impl Session {
    pub(crate) fn new(
        template: String,
        instance: String,
        data: Arc<dyn DataSource>,
        imports: ImportScope,
    ) -> Self {
        Self {
            model: RefCell::new(TemplateModel {
                template: template.clone(),
                instance,
                ..Default::default()
            }),
            template,
            data,
            raised: RefCell::new(Vec::new()),
            imports,
        }
    }

    /// Surface a typed error to the script as a plain runtime error
    fn raise(&self, err: impl Into<EngineError>) -> Box<EvalAltResult> {
        let err = err.into();
        let message = err.to_string();
        self.raised.borrow_mut().push((message.clone(), err));
        message.into()
    }

    /// Recover the typed error behind a script error message, if any
    pub(crate) fn take_raised(&self, message: &str) -> Option<EngineError> {
        let mut raised = self.raised.borrow_mut();
        let at = raised.iter().rposition(|(m, _)| m == message)?;
        Some(raised.remove(at).1)
    }

    pub(crate) fn take_model(&self) -> TemplateModel {
        std::mem::take(&mut *self.model.borrow_mut())
    }

    fn invalid_path(&self, path: &str) -> Box<EvalAltResult> {
        self.raise(ModelError::InvalidPath {
            template: self.template.clone(),
            path: path.to_string(),
        })
    }

    fn read_error(&self, err: std::io::Error) -> Box<EvalAltResult> {
        self.raise(EngineError::Io(err))
    }
}

#[derive(Clone)]
pub(crate) struct TemplateHandle {
    session: Rc<Session>,
}

#[derive(Clone)]
pub(crate) struct ImageHandle {
    session: Rc<Session>,
    image: usize,
}

#[derive(Clone)]
pub(crate) struct BuildImageHandle {
    session: Rc<Session>,
    image: usize,
}

#[derive(Clone)]
pub(crate) struct ContainerHandle {
    session: Rc<Session>,
    image: usize,
    container: usize,
}

impl TemplateHandle {
    pub(crate) fn new(session: Rc<Session>) -> Self {
        Self { session }
    }

    fn add_image(&self, name: &str, source: ImageSource) -> FnResult<usize> {
        let name = name.trim();
        if name.is_empty() {
            return Err("image name must not be empty".into());
        }

        let mut model = self.session.model.borrow_mut();
        model.images.push(ImageDecl {
            name: name.to_string(),
            source,
            containers: Vec::new(),
        });
        Ok(model.images.len() - 1)
    }

    fn fetch_image(&mut self, reference: &str) -> FnResult<ImageHandle> {
        let image = self.add_image(reference, ImageSource::Fetch)?;
        Ok(ImageHandle {
            session: self.session.clone(),
            image,
        })
    }

    fn build_image(&mut self, name: &str) -> FnResult<BuildImageHandle> {
        let image = self.add_image(name, ImageSource::Build(Workspace::default()))?;
        Ok(BuildImageHandle {
            session: self.session.clone(),
            image,
        })
    }

    fn import(&mut self, name: &str, params: Map) -> FnResult<()> {
        let params = map_to_json(&params)?;
        let session = &self.session;

        debug!("Template {} importing {}", session.template, name);

        match session.imports.run(name, &params) {
            Ok(model) => {
                session.model.borrow_mut().imports.push(model);
                Ok(())
            }
            Err(err) => Err(session.raise(err)),
        }
    }
}

fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn new_container(session: &Rc<Session>, image: usize, name: &str) -> FnResult<ContainerHandle> {
    if !is_valid_container_name(name) {
        return Err(format!("invalid container name '{}'", name).into());
    }

    let mut model = session.model.borrow_mut();
    let taken = model
        .images
        .iter()
        .any(|i| i.containers.iter().any(|c| c.name == name));
    if taken {
        drop(model);
        return Err(session.raise(ModelError::DuplicateContainer {
            name: name.to_string(),
            first: session.template.clone(),
            second: session.template.clone(),
        }));
    }

    let containers = &mut model.images[image].containers;
    containers.push(ContainerDecl {
        name: name.to_string(),
        ..Default::default()
    });

    Ok(ContainerHandle {
        session: session.clone(),
        image,
        container: containers.len() - 1,
    })
}

fn file_mode(mode: INT) -> FnResult<u32> {
    u32::try_from(mode)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid file mode {:o}", mode).into())
}

impl BuildImageHandle {
    fn with_workspace<R>(&self, f: impl FnOnce(&str, &mut Workspace) -> R) -> R {
        let mut model = self.session.model.borrow_mut();
        let image = &mut model.images[self.image];
        match &mut image.source {
            ImageSource::Build(workspace) => f(&image.name, workspace),
            ImageSource::Fetch => f(&image.name, &mut Workspace::default()),
        }
    }

    fn insert_file(&self, name: &str, content: Vec<u8>, mode: u32) -> FnResult<()> {
        let template = self.session.template.clone();
        let conflict = self.with_workspace(|image, ws| {
            if ws.files.contains_key(name) {
                return Some(ModelError::DuplicateWorkspaceFile {
                    template,
                    image: image.to_string(),
                    file: name.to_string(),
                });
            }
            ws.files
                .insert(name.to_string(), WorkspaceFile { content, mode });
            None
        });

        match conflict {
            Some(err) => Err(self.session.raise(err)),
            None => Ok(()),
        }
    }

    fn copy_data(&mut self, path: &str) -> FnResult<()> {
        let session = self.session.clone();
        let source = if path.trim() == "*" {
            String::new()
        } else {
            match normalize_path(path) {
                Some(p) if !p.is_empty() => p,
                _ => return Err(session.invalid_path(path)),
            }
        };

        let files = session
            .data
            .collect(&source)
            .map_err(|e| session.read_error(e))?;
        if files.is_empty() && !source.is_empty() {
            return Err(session.raise(ModelError::MissingData {
                template: session.template.clone(),
                path: path.to_string(),
            }));
        }

        for file in files {
            self.insert_file(&file.path, file.content, file.mode)?;
        }
        Ok(())
    }

    fn copy_data_list(&mut self, paths: Array) -> FnResult<()> {
        for path in strings("CopyDataToWorkspace paths", paths)? {
            self.copy_data(&path)?;
        }
        Ok(())
    }

    fn add_file(&mut self, name: &str, content: Vec<u8>, mode: INT) -> FnResult<()> {
        let file = match normalize_path(name) {
            Some(p) if !p.is_empty() => p,
            _ => return Err(self.session.invalid_path(name)),
        };
        self.insert_file(&file, content, file_mode(mode)?)
    }

    fn interpolate_file(&mut self, name: &str, data: Map) -> FnResult<()> {
        let file = normalize_path(name).unwrap_or_default();

        let mut substitutions = BTreeMap::new();
        for (key, value) in &data {
            substitutions.insert(
                key.to_string(),
                scalar_to_string(&format!("substitution '{}'", key), value)?,
            );
        }

        let template = self.session.template.clone();
        let missing = self.with_workspace(|image, ws| {
            if !ws.files.contains_key(&file) {
                return Some(ModelError::UnknownWorkspaceFile {
                    template,
                    image: image.to_string(),
                    file: name.to_string(),
                });
            }
            ws.substitutions
                .entry(file.clone())
                .or_default()
                .extend(substitutions);
            None
        });

        match missing {
            Some(err) => Err(self.session.raise(err)),
            None => Ok(()),
        }
    }
}

impl ContainerHandle {
    fn with<R>(&self, f: impl FnOnce(&mut ContainerDecl) -> R) -> R {
        let mut model = self.session.model.borrow_mut();
        f(&mut model.images[self.image].containers[self.container])
    }

    fn name(&self) -> String {
        self.with(|c| c.name.clone())
    }

    fn set_ports(&mut self, ports: &[INT]) -> FnResult<()> {
        for &raw in ports {
            let port = match u16::try_from(raw) {
                Ok(p) if p > 0 => p,
                _ => {
                    return Err(self.session.raise(ModelError::InvalidPort {
                        template: self.session.template.clone(),
                        container: self.name(),
                        port: raw,
                    }))
                }
            };

            let added = self.with(|c| {
                if c.ports.contains(&port) {
                    false
                } else {
                    c.ports.push(port);
                    true
                }
            });

            if !added {
                return Err(self.session.raise(ModelError::DuplicatePort {
                    template: self.session.template.clone(),
                    container: self.name(),
                    port,
                }));
            }
        }
        Ok(())
    }

    fn set_label(&mut self, key: &str, value: Dynamic) -> FnResult<()> {
        let value = scalar_to_string(&format!("label '{}'", key), &value)?;
        self.with(|c| c.labels.insert(key.to_string(), value));
        Ok(())
    }

    fn set_env(&mut self, key: &str, value: Dynamic) -> FnResult<()> {
        let value = scalar_to_string(&format!("env '{}'", key), &value)?;
        self.with(|c| c.env.insert(key.to_string(), value));
        Ok(())
    }

    fn set_cmd(&mut self, cmd: Vec<String>) {
        self.with(|c| c.cmd = cmd);
    }

    fn set_entrypoint(&mut self, path: &str) {
        self.with(|c| c.entrypoint = Some(path.to_string()));
    }

    fn mount(&mut self, dest: &str, content: Vec<u8>, mode: u32, opts: &Opts) -> FnResult<()> {
        if !dest.starts_with('/') {
            return Err(format!("mount destination '{}' must be an absolute path", dest).into());
        }

        let mount = Mount {
            dest: dest.to_string(),
            content,
            mode,
            interpolate: opts.bool("interpolate", false)?,
            readonly: opts.bool("readonly", true)?,
        };
        self.with(|c| {
            c.mounts.retain(|m| m.dest != mount.dest);
            c.mounts.push(mount);
        });
        Ok(())
    }

    fn mount_data(&mut self, src: &str, dest: &str, opts: Map) -> FnResult<()> {
        let session = self.session.clone();
        let opts = Opts::new("mount", &opts);
        let path = match normalize_path(src) {
            Some(p) if !p.is_empty() => p,
            _ => return Err(session.invalid_path(src)),
        };

        match session.data.read(&path).map_err(|e| session.read_error(e))? {
            Some(file) => self.mount(dest, file.content, file.mode, &opts),
            None if opts.bool("skip_if_nonexistent", false)? => {
                debug!(
                    "Template {}: skipping mount of missing data file {}",
                    session.template, src
                );
                Ok(())
            }
            None => Err(session.raise(ModelError::MissingData {
                template: session.template.clone(),
                path: src.to_string(),
            })),
        }
    }

    fn mount_string(&mut self, content: &str, dest: &str, mode: INT, opts: Map) -> FnResult<()> {
        let opts = Opts::new("mount", &opts);
        self.mount(dest, content.as_bytes().to_vec(), file_mode(mode)?, &opts)
    }

    fn add_readiness_check(&mut self, kind: &str, opts: Map) -> FnResult<()> {
        let check = parse_check(kind, &opts)?;
        self.with(|c| c.checks.push(check));
        Ok(())
    }
}

fn parse_check(kind: &str, map: &Map) -> FnResult<CheckSpec> {
    let opts = Opts::new(kind, map);

    let kind = match kind {
        "net" => {
            let protocol = opts.string("protocol")?.unwrap_or_else(|| "tcp".to_string());
            if protocol != "tcp" && protocol != "udp" {
                return Err(format!("net check protocol must be tcp or udp, got '{}'", protocol).into());
            }
            CheckKind::Net {
                protocol,
                address: opts.required_string("address")?,
            }
        }
        "http" => {
            let codes = opts
                .int_list("codes")?
                .into_iter()
                .map(|code| {
                    u16::try_from(code)
                        .ok()
                        .filter(|c| (100..=599).contains(c))
                        .ok_or_else(|| format!("invalid HTTP status code {}", code))
                })
                .collect::<Result<Vec<_>, _>>()?;
            CheckKind::Http {
                url: opts.required_string("url")?,
                codes,
                body: opts.string("body")?.filter(|b| !b.is_empty()),
            }
        }
        other => return Err(format!("unknown readiness check kind '{}'", other).into()),
    };

    let retry_limit = match opts.int("retry_limit")? {
        None | Some(0) => DEFAULT_RETRY_LIMIT,
        Some(n) => u32::try_from(n).map_err(|_| format!("invalid retry_limit {}", n))?,
    };

    let retry_interval = match opts.raw("retry_interval") {
        Some(value) => parse_interval(value)?,
        None => DEFAULT_RETRY_INTERVAL,
    };

    Ok(CheckSpec {
        kind,
        retry_limit,
        retry_interval,
    })
}

macro_rules! register_variadic {
    ($engine:expr, $name:literal, $handle:ty, $arg:ty, $call:expr) => {{
        let call = $call;
        $engine.register_fn($name, move |h: &mut $handle, a: $arg| call(h, vec![a]));
        $engine.register_fn($name, move |h: &mut $handle, a: $arg, b: $arg| call(h, vec![a, b]));
        $engine.register_fn($name, move |h: &mut $handle, a: $arg, b: $arg, c: $arg| {
            call(h, vec![a, b, c])
        });
        $engine.register_fn(
            $name,
            move |h: &mut $handle, a: $arg, b: $arg, c: $arg, d: $arg| call(h, vec![a, b, c, d]),
        );
        $engine.register_fn(
            $name,
            move |h: &mut $handle, a: $arg, b: $arg, c: $arg, d: $arg, e: $arg| {
                call(h, vec![a, b, c, d, e])
            },
        );
        $engine.register_fn(
            $name,
            move |h: &mut $handle, a: $arg, b: $arg, c: $arg, d: $arg, e: $arg, f: $arg| {
                call(h, vec![a, b, c, d, e, f])
            },
        );
    }};
}

/// Install the capability API, `fmt` and the `types` namespace into `engine`
pub(crate) fn register(engine: &mut Engine) {
    engine
        .register_type_with_name::<TemplateHandle>("Template")
        .register_type_with_name::<ImageHandle>("Image")
        .register_type_with_name::<BuildImageHandle>("BuildImage")
        .register_type_with_name::<ContainerHandle>("Container");

    engine
        .register_fn("FetchImage", TemplateHandle::fetch_image)
        .register_fn("BuildImage", TemplateHandle::build_image)
        .register_fn("Import", |tpl: &mut TemplateHandle, name: &str| {
            tpl.import(name, Map::new())
        })
        .register_fn("Import", TemplateHandle::import);

    engine
        .register_fn("NewContainer", |img: &mut ImageHandle, name: &str| {
            new_container(&img.session, img.image, name)
        })
        .register_fn("NewContainer", |img: &mut BuildImageHandle, name: &str| {
            new_container(&img.session, img.image, name)
        });

    engine
        .register_fn("CopyDataToWorkspace", BuildImageHandle::copy_data)
        .register_fn("CopyDataToWorkspace", BuildImageHandle::copy_data_list)
        .register_fn(
            "AddFileToWorkspace",
            |img: &mut BuildImageHandle, name: &str, content: &str, mode: INT| {
                img.add_file(name, content.as_bytes().to_vec(), mode)
            },
        )
        .register_fn(
            "AddFileToWorkspace",
            |img: &mut BuildImageHandle, name: &str, content: Blob, mode: INT| {
                img.add_file(name, content, mode)
            },
        )
        .register_fn("InterpolateWorkspaceFile", BuildImageHandle::interpolate_file);

    register_variadic!(
        engine,
        "SetPorts",
        ContainerHandle,
        INT,
        |c: &mut ContainerHandle, ports: Vec<INT>| c.set_ports(&ports)
    );
    register_variadic!(
        engine,
        "SetCmd",
        ContainerHandle,
        ImmutableString,
        |c: &mut ContainerHandle, args: Vec<ImmutableString>| {
            c.set_cmd(args.iter().map(|a| a.to_string()).collect())
        }
    );

    engine
        .register_fn("SetPorts", |c: &mut ContainerHandle, ports: Array| {
            c.set_ports(&ints("SetPorts", ports)?)
        })
        .register_fn("SetCmd", |c: &mut ContainerHandle, args: Array| -> FnResult<()> {
            c.set_cmd(strings("SetCmd", args)?);
            Ok(())
        })
        .register_fn("SetLabel", ContainerHandle::set_label)
        .register_fn("SetEnv", ContainerHandle::set_env)
        .register_fn("SetEntrypoint", ContainerHandle::set_entrypoint)
        .register_fn("MountData", |c: &mut ContainerHandle, src: &str, dest: &str| {
            c.mount_data(src, dest, Map::new())
        })
        .register_fn("MountData", ContainerHandle::mount_data)
        .register_fn(
            "MountString",
            |c: &mut ContainerHandle, content: &str, dest: &str, mode: INT| {
                c.mount_string(content, dest, mode, Map::new())
            },
        )
        .register_fn("MountString", ContainerHandle::mount_string)
        .register_fn("AddReadinessCheck", ContainerHandle::add_readiness_check);

    engine
        .register_fn("fmt", |f: &str| format_verbs(f, &[]))
        .register_fn("fmt", |f: &str, args: Array| format_verbs(f, &args))
        .register_fn("fmt", |f: &str, a: Dynamic| format_verbs(f, &[a]))
        .register_fn("fmt", |f: &str, a: Dynamic, b: Dynamic| format_verbs(f, &[a, b]))
        .register_fn("fmt", |f: &str, a: Dynamic, b: Dynamic, c: Dynamic| {
            format_verbs(f, &[a, b, c])
        })
        .register_fn(
            "fmt",
            |f: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                format_verbs(f, &[a, b, c, d])
            },
        )
        .register_fn(
            "fmt",
            |f: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic| {
                format_verbs(f, &[a, b, c, d, e])
            },
        )
        .register_fn(
            "fmt",
            |f: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic, e: Dynamic, g: Dynamic| {
                format_verbs(f, &[a, b, c, d, e, g])
            },
        );

    engine.register_static_module("types", types_module().into());
}
