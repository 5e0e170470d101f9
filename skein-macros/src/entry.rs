use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;
use syn::{ItemFn, ReturnType};

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const KNOBS: &str = "`worker_threads`, `compute_threads`";

/// Config used when the attribute does not yield a valid one, so the item
/// still expands to something close to what was written.
const DEFAULT_ERROR_CONFIG: FinalConfig = FinalConfig {
    worker_threads: None,
    compute_threads: None,
};

/// ```ignore
/// #[skein::main(worker_threads = 2)]
/// fn main() {
///     skein::create_timer_task(std::time::Duration::from_millis(10), |_| {}).start();
/// }
/// ```
///
/// expands `main` into a function that builds an engine with 2 workers,
/// enters it, runs the original body, then waits for every series started
/// from it before shutting the engine down.
pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, false))
    };

    match config {
        Ok(config) => expand(input, false, config),
        Err(e) => token_stream_with_error(expand(input, false, DEFAULT_ERROR_CONFIG), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => expand(input, true, config),
        Err(e) => token_stream_with_error(expand(input, true, DEFAULT_ERROR_CONFIG), e),
    }
}

struct FinalConfig {
    worker_threads: Option<usize>,
    compute_threads: Option<usize>,
}

#[derive(Default)]
struct ConfigBuilder {
    worker_threads: Option<usize>,
    compute_threads: Option<usize>,
}

impl ConfigBuilder {
    fn set(slot: &mut Option<usize>, name: &str, lit: &syn::Lit) -> Result<(), syn::Error> {
        let span = lit.span();

        if slot.is_some() {
            return Err(syn::Error::new(span, format!("`{name}` set multiple times.")));
        }

        let value = parse_int(lit, span, name)?;
        if value == 0 {
            return Err(syn::Error::new(span, format!("`{name}` may not be 0.")));
        }

        *slot = Some(value);
        Ok(())
    }

    fn build(self) -> FinalConfig {
        FinalConfig {
            worker_threads: self.worker_threads,
            compute_threads: self.compute_threads,
        }
    }
}

fn macro_name(is_test: bool) -> &'static str {
    if is_test { "skein::test" } else { "skein::main" }
}

fn build_config(input: &ItemFn, args: AttributeArgs, is_test: bool) -> Result<FinalConfig, syn::Error> {
    if let Some(asyncness) = input.sig.asyncness {
        let msg = format!(
            "`#[{}]` runs a plain function: remove `async` and start series from the body",
            macro_name(is_test)
        );
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    let mut config = ConfigBuilder::default();

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&namevalue, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();

                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };

                match ident.as_str() {
                    "worker_threads" => ConfigBuilder::set(&mut config.worker_threads, "worker_threads", lit)?,
                    "compute_threads" => ConfigBuilder::set(&mut config.compute_threads, "compute_threads", lit)?,
                    name => {
                        let msg = format!("Unknown attribute {name} is specified; expected one of: {KNOBS}");
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .map(ToString::to_string)
                    .unwrap_or_default()
                    .to_lowercase();

                let msg = match name.as_str() {
                    "worker_threads" | "compute_threads" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    "flavor" => format!(
                        "`#[{}]` has a single scheduler flavor; set {KNOBS} instead.",
                        macro_name(is_test)
                    ),
                    name => format!("Unknown attribute {name} is specified; expected one of: {KNOBS}."),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(other, "Unknown attribute inside the macro"));
            }
        }
    }

    Ok(config.build())
}

fn expand(mut input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    input.sig.asyncness = None;

    // Point type mismatches at the last statement rather than the attribute.
    let last_stmt_span = input
        .block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let mut engine = quote_spanned! {last_stmt_span=>
        skein::Builder::new()
    };

    if let Some(n) = config.worker_threads {
        engine = quote_spanned! {last_stmt_span=> #engine.worker_threads(#n) };
    }

    if let Some(n) = config.compute_threads {
        engine = quote_spanned! {last_stmt_span=> #engine.compute_threads(#n) };
    }

    let output_type = match &input.sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };

    let generated_attrs = if is_test {
        quote! { #[::core::prelude::v1::test] }
    } else {
        quote! {}
    };

    let body = &input.block;
    let block = quote_spanned! {last_stmt_span=>
        {
            let body = || -> #output_type #body;

            #[allow(clippy::expect_used)]
            let engine = #engine
                .try_build()
                .expect("Failed building the Engine");

            let out = engine.enter(body);
            engine.wait_finish();
            engine.shutdown();

            #[allow(clippy::needless_return)]
            return out;
        }
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;

    quote! {
        #(#attrs)*
        #generated_attrs
        #vis #sig #block
    }
}
