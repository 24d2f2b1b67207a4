pub mod cgi;
pub mod standalone;
pub mod static_files;

use crate::config::{ Config, ServeMode };
use crate::http::{ HttpRequest, HttpResponse };
use cgi::{ CgiBridge, ProcessInterpreter, ScriptTarget };
use standalone::StandaloneLauncher;
use static_files::StaticFiles;

/// Which responder a request path goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Static,
    /// Run the requested `.php` file itself.
    Script,
    /// Run the front controller.
    FrontController,
    Redirect,
}

impl Route {
    pub fn for_path(mode: ServeMode, path: &str) -> Self {
        match mode {
            ServeMode::Static => Route::Static,
            ServeMode::Script if is_php(path) => Route::Script,
            ServeMode::Script => Route::Static,
            ServeMode::Router if is_php(path) || is_extensionless(path) => Route::FrontController,
            ServeMode::Router => Route::Static,
            ServeMode::Standalone => Route::Redirect,
        }
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_php(path: &str) -> bool {
    last_segment(path).to_ascii_lowercase().ends_with(".php")
}

/// Also true for `/` and directory-style paths ending in a slash.
fn is_extensionless(path: &str) -> bool {
    !last_segment(path).contains('.')
}

pub struct Dispatcher {
    mode: ServeMode,
    static_files: StaticFiles,
    cgi: CgiBridge,
    router_script: String,
    standalone: StandaloneLauncher,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        static_files: StaticFiles,
        cgi: CgiBridge
    ) -> Self {
        Self {
            mode: config.mode,
            static_files,
            cgi,
            router_script: config.interpreter.router_script.clone(),
            standalone: StandaloneLauncher::new(config),
        }
    }

    /// Wires up the real interpreter from `config`.
    pub fn from_config(config: &Config) -> Self {
        let static_files = StaticFiles::new(
            &config.document_root,
            config.index.clone(),
            config.allow_traversal
        );
        let interpreter = ProcessInterpreter::new(
            config.interpreter.path.clone(),
            static_files.root(),
            config.interpreter.timeout()
        );
        let cgi = CgiBridge::new(
            Box::new(interpreter),
            static_files.root(),
            config.host.clone(),
            config.port
        );
        Self::new(config, static_files, cgi)
    }

    pub fn dispatch(&mut self, req: &HttpRequest) -> HttpResponse {
        let path = req.path();

        match Route::for_path(self.mode, path) {
            Route::Static => self.static_files.handle(path),
            Route::Script => {
                match self.static_files.existing_file(path) {
                    Some(file) => {
                        let name = static_files::decode_path(path);
                        self.cgi.handle(req, &ScriptTarget::new(file, &name))
                    }
                    None => StaticFiles::not_found(),
                }
            }
            Route::FrontController => {
                let router = self.static_files.root().join(&self.router_script);
                if !router.is_file() {
                    tracing::error!(script = %router.display(), "front controller is missing");
                    return HttpResponse::internal_error(
                        format!("front controller {} not found", self.router_script)
                    );
                }
                self.cgi.handle(req, &ScriptTarget::new(router, &self.router_script))
            }
            Route::Redirect => self.standalone.handle(req),
        }
    }
}
