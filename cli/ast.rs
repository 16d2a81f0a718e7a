// Copyright 2024-2026 the Bungae authors. MIT license.

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::rc::Rc;
use std::result;
use std::sync::Arc;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use regex::Regex;
use swc_common::comments::SingleThreadedComments;
use swc_common::errors::Diagnostic;
use swc_common::errors::DiagnosticBuilder;
use swc_common::errors::Emitter;
use swc_common::errors::Handler;
use swc_common::errors::HandlerFlags;
use swc_common::FileName;
use swc_common::Globals;
use swc_common::SourceMap;
use swc_common::DUMMY_SP;
use swc_ecmascript::ast::AssignExpr;
use swc_ecmascript::ast::AssignOp;
use swc_ecmascript::ast::AssignPatProp;
use swc_ecmascript::ast::BinExpr;
use swc_ecmascript::ast::BinaryOp;
use swc_ecmascript::ast::Bool;
use swc_ecmascript::ast::CallExpr;
use swc_ecmascript::ast::ClassDecl;
use swc_ecmascript::ast::Decl;
use swc_ecmascript::ast::DefaultDecl;
use swc_ecmascript::ast::Expr;
use swc_ecmascript::ast::ExprOrSpread;
use swc_ecmascript::ast::ExprOrSuper;
use swc_ecmascript::ast::ExprStmt;
use swc_ecmascript::ast::FnDecl;
use swc_ecmascript::ast::ForInStmt;
use swc_ecmascript::ast::Ident;
use swc_ecmascript::ast::IfStmt;
use swc_ecmascript::ast::ImportSpecifier;
use swc_ecmascript::ast::KeyValuePatProp;
use swc_ecmascript::ast::Lit;
use swc_ecmascript::ast::MemberExpr;
use swc_ecmascript::ast::Module;
use swc_ecmascript::ast::ModuleDecl;
use swc_ecmascript::ast::ModuleItem;
use swc_ecmascript::ast::Number;
use swc_ecmascript::ast::ObjectPat;
use swc_ecmascript::ast::ObjectPatProp;
use swc_ecmascript::ast::Pat;
use swc_ecmascript::ast::Program;
use swc_ecmascript::ast::PropName;
use swc_ecmascript::ast::Stmt;
use swc_ecmascript::ast::Str;
use swc_ecmascript::ast::VarDecl;
use swc_ecmascript::ast::VarDeclKind;
use swc_ecmascript::ast::VarDeclOrPat;
use swc_ecmascript::ast::VarDeclarator;
use swc_ecmascript::codegen::text_writer::JsWriter;
use swc_ecmascript::codegen::Node;
use swc_ecmascript::parser::lexer::Lexer;
use swc_ecmascript::parser::EsConfig;
use swc_ecmascript::parser::JscTarget;
use swc_ecmascript::parser::StringInput;
use swc_ecmascript::parser::Syntax;
use swc_ecmascript::parser::TsConfig;
use swc_ecmascript::transforms::fixer;
use swc_ecmascript::transforms::helpers;
use swc_ecmascript::transforms::pass::Optional;
use swc_ecmascript::transforms::react;
use swc_ecmascript::transforms::typescript;
use swc_ecmascript::visit::Fold;
use swc_ecmascript::visit::FoldWith;

use crate::config::Platform;
use crate::errors::TransformError;
use crate::media_type::MediaType;

static TARGET: JscTarget = JscTarget::Es2020;

static FLOW_PRAGMA_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"(?m)^\s*(\*|//)?\s*@(no)?flow\b").unwrap());

/// A buffer for collecting diagnostic messages from the AST parser.
#[derive(Debug)]
pub struct DiagnosticBuffer(Vec<String>);

impl Error for DiagnosticBuffer {}

impl fmt::Display for DiagnosticBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = self.0.join(",");
    f.pad(&s)
  }
}

impl DiagnosticBuffer {
  pub fn from_error_buffer(error_buffer: ErrorBuffer) -> Self {
    let s = error_buffer.0.read().unwrap().clone();
    let diagnostics = s.iter().map(|d| d.message()).collect::<Vec<String>>();
    Self(diagnostics)
  }
}

/// A buffer for collecting errors from the AST parser.
#[derive(Debug, Clone)]
pub struct ErrorBuffer(Arc<RwLock<Vec<Diagnostic>>>);

impl ErrorBuffer {
  pub fn new() -> Self {
    Self(Arc::new(RwLock::new(Vec::new())))
  }
}

impl Emitter for ErrorBuffer {
  fn emit(&mut self, db: &DiagnosticBuilder) {
    self.0.write().unwrap().push((**db).clone());
  }
}

fn get_es_config(jsx: bool) -> EsConfig {
  EsConfig {
    class_private_methods: true,
    class_private_props: true,
    class_props: true,
    dynamic_import: true,
    export_default_from: true,
    export_namespace_from: true,
    import_meta: true,
    jsx,
    nullish_coalescing: true,
    num_sep: true,
    optional_chaining: true,
    top_level_await: true,
    ..EsConfig::default()
  }
}

fn get_ts_config(tsx: bool) -> TsConfig {
  TsConfig {
    decorators: true,
    dynamic_import: true,
    tsx,
    ..TsConfig::default()
  }
}

fn get_syntax(media_type: MediaType, as_typescript: bool) -> Syntax {
  if as_typescript {
    // .ts never holds JSX; everything else routed here (TSX, or Flow
    // carried by .js/.jsx) may.
    let tsx = !matches!(media_type, MediaType::TypeScript);
    Syntax::Typescript(get_ts_config(tsx))
  } else {
    // React Native convention allows JSX in plain .js files.
    Syntax::Es(get_es_config(true))
  }
}

/// Looks for a `@flow` / `@noflow` pragma in the leading comment region.
pub fn has_flow_pragma(source: &str) -> bool {
  let mut end = source.len().min(2048);
  while end < source.len() && !source.is_char_boundary(end) {
    end += 1;
  }
  FLOW_PRAGMA_RE.is_match(&source[..end])
}

fn is_flow_stub(specifier: &str) -> bool {
  specifier.ends_with(".flow") || specifier.ends_with(".flow.js")
}

/// Options which can be adjusted when transforming a module.
#[derive(Debug, Clone)]
pub struct TransformOptions {
  pub platform: Platform,
  pub dev: bool,
  /// Module the automatic JSX runtime is imported from.
  pub jsx_import_source: String,
  /// Emit an external source map alongside the code.
  pub source_maps: bool,
  /// Detect and strip Flow annotations in .js/.jsx files.
  pub flow: bool,
}

impl Default for TransformOptions {
  fn default() -> Self {
    Self {
      platform: Platform::Ios,
      dev: true,
      jsx_import_source: "react".to_string(),
      source_maps: true,
      flow: true,
    }
  }
}

/// The lowered CommonJS body of a module plus everything the graph needs
/// to wire it up.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
  pub code: String,
  pub source_map: Option<String>,
  /// Dependency specifiers exactly as written, in first-occurrence order.
  pub specifiers: Vec<String>,
}

/// A logical structure to hold the value of a parsed module for further
/// processing.
pub struct ParsedModule {
  comments: SingleThreadedComments,
  module: Module,
  source_map: Rc<SourceMap>,
}

/// For a given path, source, and media type, parse the source of the
/// module and return a representation which can be further processed.
pub fn parse(
  path: &Path,
  source: &str,
  media_type: MediaType,
  as_typescript: bool,
) -> result::Result<ParsedModule, TransformError> {
  let source_map = SourceMap::default();
  let source_file = source_map.new_source_file(
    FileName::Real(path.to_path_buf()),
    source.to_string(),
  );
  let error_buffer = ErrorBuffer::new();
  let syntax = get_syntax(media_type, as_typescript);
  let input = StringInput::from(&*source_file);
  let comments = SingleThreadedComments::default();

  let handler = Handler::with_emitter_and_flags(
    Box::new(error_buffer.clone()),
    HandlerFlags {
      can_emit_warnings: true,
      dont_buffer_diagnostics: true,
      ..HandlerFlags::default()
    },
  );

  let lexer = Lexer::new(syntax, TARGET, input, Some(&comments));
  let mut parser = swc_ecmascript::parser::Parser::new_from(lexer);

  let module = parser.parse_module().map_err(move |err| {
    let mut diagnostic = err.into_diagnostic(&handler);
    diagnostic.emit();
    TransformError {
      path: path.to_path_buf(),
      diagnostic: DiagnosticBuffer::from_error_buffer(error_buffer)
        .to_string(),
    }
  })?;

  Ok(ParsedModule {
    comments,
    module,
    source_map: Rc::new(source_map),
  })
}

/// Transforms raw source into a Metro factory body: JSX and types lowered
/// away, ESM rewritten to CommonJS, every dependency site rewritten to a
/// `dependencyMap[i]` access.
pub fn transform(
  path: &Path,
  source: &str,
  media_type: MediaType,
  options: &TransformOptions,
) -> result::Result<TransformOutput, TransformError> {
  let is_flow = options.flow
    && matches!(media_type, MediaType::JavaScript | MediaType::Jsx)
    && has_flow_pragma(source);
  let mut strip_types = media_type.is_typed() || is_flow;

  let parsed = match parse(path, source, media_type, strip_types) {
    Ok(parsed) => parsed,
    Err(err) => {
      // A file without the pragma can still be Flow; a parse that only
      // succeeds under the type-stripping grammar marks it as such.
      if strip_types
        || !matches!(media_type, MediaType::JavaScript | MediaType::Jsx)
      {
        return Err(err);
      }
      match parse(path, source, media_type, true) {
        Ok(parsed) => {
          strip_types = true;
          parsed
        }
        Err(_) => return Err(err),
      }
    }
  };

  parsed.transform(path, media_type, strip_types, options)
}

impl ParsedModule {
  fn transform(
    self,
    path: &Path,
    media_type: MediaType,
    strip_types: bool,
    options: &TransformOptions,
  ) -> result::Result<TransformOutput, TransformError> {
    let transform_jsx = !matches!(media_type, MediaType::TypeScript);
    let program = Program::Module(self.module);

    let jsx_pass = react::react(
      self.source_map.clone(),
      Some(&self.comments),
      react::Options {
        runtime: Some(react::Runtime::Automatic),
        import_source: options.jsx_import_source.clone(),
        development: options.dev,
        use_builtins: true,
        ..Default::default()
      },
    );
    let mut define_pass = DefineInliner {
      dev: options.dev,
      platform: options.platform,
    };
    let mut cjs_pass = CjsLower::default();
    let mut collector = DependencyCollector::default();

    let program = swc_common::GLOBALS.set(&Globals::new(), || {
      helpers::HELPERS.set(&helpers::Helpers::new(false), || {
        let program =
          program.fold_with(&mut Optional::new(jsx_pass, transform_jsx));
        let program = program.fold_with(&mut define_pass);
        let program = program
          .fold_with(&mut Optional::new(typescript::strip(), strip_types));
        let program = program.fold_with(&mut cjs_pass);
        let program = program.fold_with(&mut collector);
        program.fold_with(&mut fixer(Some(&self.comments)))
      })
    });

    let mut src_map_buf = vec![];
    let mut buf = vec![];
    {
      let writer = Box::new(JsWriter::new(
        self.source_map.clone(),
        "\n",
        &mut buf,
        if options.source_maps {
          Some(&mut src_map_buf)
        } else {
          None
        },
      ));
      let config = swc_ecmascript::codegen::Config { minify: false };
      let mut emitter = swc_ecmascript::codegen::Emitter {
        cfg: config,
        comments: Some(&self.comments),
        cm: self.source_map.clone(),
        wr: writer,
      };
      program.emit_with(&mut emitter).map_err(|err| TransformError {
        path: path.to_path_buf(),
        diagnostic: err.to_string(),
      })?;
    }
    let code = String::from_utf8(buf).map_err(|err| TransformError {
      path: path.to_path_buf(),
      diagnostic: err.to_string(),
    })?;

    let source_map = if options.source_maps {
      let mut map_buf = Vec::new();
      self
        .source_map
        .build_source_map_from(&mut src_map_buf, None)
        .to_writer(&mut map_buf)
        .map_err(|err| TransformError {
          path: path.to_path_buf(),
          diagnostic: err.to_string(),
        })?;
      Some(String::from_utf8(map_buf).map_err(|err| TransformError {
        path: path.to_path_buf(),
        diagnostic: err.to_string(),
      })?)
    } else {
      None
    };

    Ok(TransformOutput {
      code,
      source_map,
      specifiers: collector.specifiers,
    })
  }
}

fn ident(sym: &str) -> Ident {
  Ident::new(sym.into(), DUMMY_SP)
}

fn str_lit(value: &str) -> Expr {
  Expr::Lit(Lit::Str(Str {
    span: DUMMY_SP,
    value: value.into(),
    has_escape: false,
  }))
}

fn call(callee: Expr, args: Vec<Expr>) -> Expr {
  Expr::Call(CallExpr {
    span: DUMMY_SP,
    callee: ExprOrSuper::Expr(Box::new(callee)),
    args: args
      .into_iter()
      .map(|expr| ExprOrSpread {
        spread: None,
        expr: Box::new(expr),
      })
      .collect(),
    type_args: None,
  })
}

fn require_call(specifier: &str) -> Expr {
  call(Expr::Ident(ident("require")), vec![str_lit(specifier)])
}

fn member(obj: Expr, prop: Expr, computed: bool) -> Expr {
  Expr::Member(MemberExpr {
    span: DUMMY_SP,
    obj: ExprOrSuper::Expr(Box::new(obj)),
    prop: Box::new(prop),
    computed,
  })
}

fn exports_member(name: &Ident) -> Expr {
  member(
    Expr::Ident(ident("exports")),
    Expr::Ident(name.clone()),
    false,
  )
}

fn const_stmt(pat: Pat, init: Expr) -> Stmt {
  Stmt::Decl(Decl::Var(VarDecl {
    span: DUMMY_SP,
    kind: VarDeclKind::Const,
    declare: false,
    decls: vec![VarDeclarator {
      span: DUMMY_SP,
      name: pat,
      init: Some(Box::new(init)),
      definite: false,
    }],
  }))
}

fn assign_stmt(target: Expr, value: Expr) -> Stmt {
  Stmt::Expr(ExprStmt {
    span: DUMMY_SP,
    expr: Box::new(Expr::Assign(AssignExpr {
      span: DUMMY_SP,
      op: AssignOp::Assign,
      left: swc_ecmascript::ast::PatOrExpr::Expr(Box::new(target)),
      right: Box::new(value),
    })),
  })
}

fn expr_stmt(expr: Expr) -> Stmt {
  Stmt::Expr(ExprStmt {
    span: DUMMY_SP,
    expr: Box::new(expr),
  })
}

/// Collects every identifier bound by a pattern, recursively.
fn collect_pat_idents(pat: &Pat, names: &mut Vec<Ident>) {
  match pat {
    Pat::Ident(ident) => names.push(ident.clone()),
    Pat::Array(array_pat) => {
      for elem in array_pat.elems.iter().flatten() {
        collect_pat_idents(elem, names);
      }
    }
    Pat::Rest(rest_pat) => collect_pat_idents(rest_pat.arg.as_ref(), names),
    Pat::Object(object_pat) => {
      for prop in object_pat.props.iter() {
        match prop {
          ObjectPatProp::Assign(assign_pat) => {
            names.push(assign_pat.key.clone())
          }
          ObjectPatProp::KeyValue(key_value) => {
            collect_pat_idents(key_value.value.as_ref(), names)
          }
          ObjectPatProp::Rest(rest_pat) => {
            collect_pat_idents(rest_pat.arg.as_ref(), names)
          }
        }
      }
    }
    Pat::Assign(assign_pat) => {
      collect_pat_idents(assign_pat.left.as_ref(), names)
    }
    _ => {}
  }
}

/// Substitutes the build-time constants `__DEV__`, `__PLATFORM__` and
/// `process.env.NODE_ENV`.
struct DefineInliner {
  dev: bool,
  platform: Platform,
}

impl DefineInliner {
  fn node_env(&self) -> &'static str {
    if self.dev {
      "development"
    } else {
      "production"
    }
  }
}

fn is_process_env_node_env(node: &MemberExpr) -> bool {
  if node.computed {
    return false;
  }
  match &*node.prop {
    Expr::Ident(prop) if &*prop.sym == "NODE_ENV" => {}
    _ => return false,
  }
  let obj = match &node.obj {
    ExprOrSuper::Expr(obj) => obj,
    _ => return false,
  };
  let inner = match &**obj {
    Expr::Member(inner) if !inner.computed => inner,
    _ => return false,
  };
  match &*inner.prop {
    Expr::Ident(prop) if &*prop.sym == "env" => {}
    _ => return false,
  }
  matches!(
    &inner.obj,
    ExprOrSuper::Expr(e) if matches!(&**e, Expr::Ident(i) if &*i.sym == "process")
  )
}

impl Fold for DefineInliner {
  // Non-computed member props are plain idents in the AST; `obj.__DEV__`
  // must not be rewritten.
  fn fold_member_expr(&mut self, node: MemberExpr) -> MemberExpr {
    let obj = match node.obj {
      ExprOrSuper::Expr(obj) => {
        ExprOrSuper::Expr(Box::new(self.fold_expr(*obj)))
      }
      other => other,
    };
    let prop = if node.computed {
      Box::new(self.fold_expr(*node.prop))
    } else {
      node.prop
    };
    MemberExpr {
      obj,
      prop,
      ..node
    }
  }

  fn fold_expr(&mut self, expr: Expr) -> Expr {
    let expr = expr.fold_children_with(self);
    match &expr {
      Expr::Ident(id) if &*id.sym == "__DEV__" => Expr::Lit(Lit::Bool(Bool {
        span: DUMMY_SP,
        value: self.dev,
      })),
      Expr::Ident(id) if &*id.sym == "__PLATFORM__" => {
        str_lit(self.platform.as_str())
      }
      Expr::Member(node) if is_process_env_node_env(node) => {
        str_lit(self.node_env())
      }
      _ => expr,
    }
  }
}

/// Rewrites ESM module items into CommonJS statements addressing the Metro
/// factory parameters: `require`, `exports`, `metroImportDefault` and
/// `metroImportAll`.
#[derive(Default)]
struct CjsLower {
  export_all_count: usize,
}

impl Fold for CjsLower {
  fn fold_module(&mut self, module: Module) -> Module {
    let mut body: Vec<ModuleItem> = Vec::with_capacity(module.body.len());
    for item in module.body {
      match item {
        ModuleItem::ModuleDecl(decl) => self.lower(decl, &mut body),
        ModuleItem::Stmt(stmt) => body.push(ModuleItem::Stmt(stmt)),
      }
    }
    Module { body, ..module }
  }
}

impl CjsLower {
  fn lower(&mut self, decl: ModuleDecl, out: &mut Vec<ModuleItem>) {
    match decl {
      ModuleDecl::Import(import) => {
        if import.type_only {
          return;
        }
        let src = import.src.value.to_string();
        if is_flow_stub(&src) {
          return;
        }
        if import.specifiers.is_empty() {
          out.push(ModuleItem::Stmt(expr_stmt(require_call(&src))));
          return;
        }
        let mut named_props: Vec<ObjectPatProp> = Vec::new();
        for specifier in import.specifiers {
          match specifier {
            ImportSpecifier::Default(default) => {
              out.push(ModuleItem::Stmt(const_stmt(
                Pat::Ident(default.local),
                call(
                  Expr::Ident(ident("metroImportDefault")),
                  vec![require_call(&src)],
                ),
              )));
            }
            ImportSpecifier::Namespace(namespace) => {
              out.push(ModuleItem::Stmt(const_stmt(
                Pat::Ident(namespace.local),
                call(
                  Expr::Ident(ident("metroImportAll")),
                  vec![require_call(&src)],
                ),
              )));
            }
            ImportSpecifier::Named(named) => match named.imported {
              Some(imported) if imported.sym != named.local.sym => {
                named_props.push(ObjectPatProp::KeyValue(KeyValuePatProp {
                  key: PropName::Ident(imported),
                  value: Box::new(Pat::Ident(named.local)),
                }));
              }
              _ => {
                named_props.push(ObjectPatProp::Assign(AssignPatProp {
                  span: DUMMY_SP,
                  key: named.local,
                  value: None,
                }));
              }
            },
          }
        }
        if !named_props.is_empty() {
          out.push(ModuleItem::Stmt(const_stmt(
            Pat::Object(ObjectPat {
              span: DUMMY_SP,
              props: named_props,
              optional: false,
              type_ann: None,
            }),
            require_call(&src),
          )));
        }
      }
      ModuleDecl::ExportDecl(export) => {
        let mut names: Vec<Ident> = Vec::new();
        match &export.decl {
          Decl::Class(class_decl) => names.push(class_decl.ident.clone()),
          Decl::Fn(fn_decl) => names.push(fn_decl.ident.clone()),
          Decl::Var(var_decl) => {
            for decl in var_decl.decls.iter() {
              collect_pat_idents(&decl.name, &mut names);
            }
          }
          Decl::TsEnum(ts_enum) => names.push(ts_enum.id.clone()),
          _ => {}
        }
        out.push(ModuleItem::Stmt(Stmt::Decl(export.decl)));
        for name in names {
          out.push(ModuleItem::Stmt(assign_stmt(
            exports_member(&name),
            Expr::Ident(name.clone()),
          )));
        }
      }
      ModuleDecl::ExportNamed(named) => {
        if named.type_only {
          return;
        }
        let maybe_src = named.src.as_ref().map(|s| s.value.to_string());
        for specifier in named.specifiers {
          match specifier {
            swc_ecmascript::ast::ExportSpecifier::Named(spec) => {
              let exported = spec.exported.unwrap_or_else(|| spec.orig.clone());
              let value = match &maybe_src {
                Some(src) => member(
                  require_call(src),
                  Expr::Ident(spec.orig.clone()),
                  false,
                ),
                None => Expr::Ident(spec.orig.clone()),
              };
              out.push(ModuleItem::Stmt(assign_stmt(
                exports_member(&exported),
                value,
              )));
            }
            swc_ecmascript::ast::ExportSpecifier::Namespace(spec) => {
              if let Some(src) = &maybe_src {
                out.push(ModuleItem::Stmt(assign_stmt(
                  exports_member(&spec.name),
                  call(
                    Expr::Ident(ident("metroImportAll")),
                    vec![require_call(src)],
                  ),
                )));
              }
            }
            swc_ecmascript::ast::ExportSpecifier::Default(_) => {}
          }
        }
      }
      ModuleDecl::ExportDefaultDecl(default_decl) => match default_decl.decl {
        DefaultDecl::Fn(fn_expr) => match fn_expr.ident {
          Some(name) => {
            out.push(ModuleItem::Stmt(Stmt::Decl(Decl::Fn(FnDecl {
              ident: name.clone(),
              declare: false,
              function: fn_expr.function,
            }))));
            out.push(ModuleItem::Stmt(assign_stmt(
              exports_member(&ident("default")),
              Expr::Ident(name),
            )));
          }
          None => out.push(ModuleItem::Stmt(assign_stmt(
            exports_member(&ident("default")),
            Expr::Fn(swc_ecmascript::ast::FnExpr {
              ident: None,
              function: fn_expr.function,
            }),
          ))),
        },
        DefaultDecl::Class(class_expr) => match class_expr.ident {
          Some(name) => {
            out.push(ModuleItem::Stmt(Stmt::Decl(Decl::Class(ClassDecl {
              ident: name.clone(),
              declare: false,
              class: class_expr.class,
            }))));
            out.push(ModuleItem::Stmt(assign_stmt(
              exports_member(&ident("default")),
              Expr::Ident(name),
            )));
          }
          None => out.push(ModuleItem::Stmt(assign_stmt(
            exports_member(&ident("default")),
            Expr::Class(swc_ecmascript::ast::ClassExpr {
              ident: None,
              class: class_expr.class,
            }),
          ))),
        },
        DefaultDecl::TsInterfaceDecl(_) => {}
      },
      ModuleDecl::ExportDefaultExpr(default_expr) => {
        out.push(ModuleItem::Stmt(assign_stmt(
          exports_member(&ident("default")),
          *default_expr.expr,
        )));
      }
      ModuleDecl::ExportAll(export_all) => {
        let src = export_all.src.value.to_string();
        if is_flow_stub(&src) {
          return;
        }
        let source_ident =
          ident(&format!("_exportAll{}", self.export_all_count));
        let key_ident = ident(&format!("_key{}", self.export_all_count));
        self.export_all_count += 1;

        out.push(ModuleItem::Stmt(const_stmt(
          Pat::Ident(source_ident.clone()),
          require_call(&src),
        )));
        // for (var k in m) if (k !== "default") exports[k] = m[k];
        out.push(ModuleItem::Stmt(Stmt::ForIn(ForInStmt {
          span: DUMMY_SP,
          left: VarDeclOrPat::VarDecl(VarDecl {
            span: DUMMY_SP,
            kind: VarDeclKind::Var,
            declare: false,
            decls: vec![VarDeclarator {
              span: DUMMY_SP,
              name: Pat::Ident(key_ident.clone()),
              init: None,
              definite: false,
            }],
          }),
          right: Box::new(Expr::Ident(source_ident.clone())),
          body: Box::new(Stmt::If(IfStmt {
            span: DUMMY_SP,
            test: Box::new(Expr::Bin(BinExpr {
              span: DUMMY_SP,
              op: BinaryOp::NotEqEq,
              left: Box::new(Expr::Ident(key_ident.clone())),
              right: Box::new(str_lit("default")),
            })),
            cons: Box::new(assign_stmt(
              member(
                Expr::Ident(ident("exports")),
                Expr::Ident(key_ident.clone()),
                true,
              ),
              member(
                Expr::Ident(source_ident),
                Expr::Ident(key_ident),
                true,
              ),
            )),
            alt: None,
          })),
        })));
      }
      ModuleDecl::TsImportEquals(_)
      | ModuleDecl::TsExportAssignment(_)
      | ModuleDecl::TsNamespaceExport(_) => {}
    }
  }
}

/// Walks the lowered AST collecting dependency specifiers from
/// `require("...")` and `import("...")` call sites and rewriting their
/// argument to a `dependencyMap[i]` access.
#[derive(Default)]
struct DependencyCollector {
  specifiers: Vec<String>,
}

impl DependencyCollector {
  fn index_of(&mut self, specifier: &str) -> usize {
    if let Some(index) =
      self.specifiers.iter().position(|s| s == specifier)
    {
      return index;
    }
    self.specifiers.push(specifier.to_string());
    self.specifiers.len() - 1
  }
}

impl Fold for DependencyCollector {
  fn fold_call_expr(&mut self, node: CallExpr) -> CallExpr {
    let mut node = node.fold_children_with(self);
    let is_dependency_site = match &node.callee {
      ExprOrSuper::Expr(callee) => matches!(
        &**callee,
        Expr::Ident(id) if &*id.sym == "require" || &*id.sym == "import"
      ),
      _ => false,
    };
    if !is_dependency_site || node.args.len() != 1 {
      return node;
    }
    let specifier = match &*node.args[0].expr {
      Expr::Lit(Lit::Str(s)) => s.value.to_string(),
      _ => return node,
    };
    if is_flow_stub(&specifier) {
      return node;
    }
    let index = self.index_of(&specifier);
    node.args[0] = ExprOrSpread {
      spread: None,
      expr: Box::new(member(
        Expr::Ident(ident("dependencyMap")),
        Expr::Lit(Lit::Num(Number {
          span: DUMMY_SP,
          value: index as f64,
        })),
        true,
      )),
    };
    node
  }
}
