use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Test attribute that installs the runq tracing subscriber before the body runs.
///
/// Async functions become `#[tokio::test]` and forward any arguments, so
/// `#[runq::test(start_paused = true)]` drives the body on paused tokio time.
/// Sync functions become plain `#[test]`.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let runtime_args = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let body = &input.block;
    let name = &input.sig.ident;

    let forwarded = if runtime_args.is_empty() {
        quote! {}
    } else {
        quote! { ( #runtime_args ) }
    };

    let expanded = if sig.asyncness.is_some() {
        quote! {
            #(#attrs)*
            #[tokio::test #forwarded]
            #vis #sig {
                runq::trace::with_test_tracing(stringify!(#name), || async move #body).await
            }
        }
    } else {
        quote! {
            #(#attrs)*
            #[test]
            #vis #sig {
                runq::trace::with_test_tracing_sync(stringify!(#name), || #body)
            }
        }
    };
    expanded.into()
}
