use proc_macro2::{Span, TokenStream};
use syn::{Attribute, Meta};

pub(crate) fn parse_int(lit: &syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    let syn::Lit::Int(int) = lit else {
        return Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        ));
    };

    int.base10_parse::<usize>().map_err(|e| {
        syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer: {e}"),
        )
    })
}

/// `#[test]`, `#[core::prelude::*::test]` or `#[std::prelude::*::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }

    let idents: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    match idents.as_slice() {
        [test] => path.leading_colon.is_none() && test == "test",
        [root, prelude, _, test] => {
            (root == "core" || root == "std") && prelude == "prelude" && test == "test"
        }
        _ => false,
    }
}

/// Keeps the original item next to the error so IDEs still see it.
pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
