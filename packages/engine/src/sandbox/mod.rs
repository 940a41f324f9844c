// ABOUTME: Sandboxed template execution
// ABOUTME: Loaders, the capability API and the executor that runs template scripts

mod capability;
mod executor;
mod helpers;
pub mod loader;

pub use executor::{Invocation, SandboxLimits, TemplateExecutor};
pub use loader::{
    normalize_path, DataFile, DataSource, DirDataSource, DirTemplateLoader, MemoryTemplateLoader,
    TemplateLoader, TemplateSource, DATA_DIR_SUFFIX, TEMPLATE_SUFFIX,
};
