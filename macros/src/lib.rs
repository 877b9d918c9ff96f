//! Augment the development of keystream crates with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Ident, ItemFn, LitStr};

/// Levels accepted by [macro@test_traced].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test function with a `tracing` subscriber that writes to the test output.
///
/// The log level defaults to `DEBUG` and can be overridden with a string literal
/// (`#[test_traced("INFO")]`). When applied to an `async fn`, the body is driven to
/// completion on a multi-threaded `tokio` runtime whose threads all log to the test's subscriber.
///
/// The expanded test refers to `::tracing` and `::tracing_subscriber` (and `::tokio`
/// for async tests), so the calling crate must list them as (dev-)dependencies.
///
/// # Example
///
/// ```rust,ignore
/// use keystream_macros::test_traced;
/// use tracing::{debug, info};
///
/// #[test_traced("INFO")]
/// fn test_info_level() {
///     info!("This is an info log");
///     debug!("This is a debug log (won't be shown)");
///     assert_eq!(2 + 2, 4);
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the log level
    let level = if attr.is_empty() {
        String::from("DEBUG")
    } else {
        parse_macro_input!(attr as LitStr).value().to_uppercase()
    };
    if !LEVELS.contains(&level.as_str()) {
        return syn::Error::new(
            Span::call_site(),
            format!("invalid log level `{level}`, expected one of {LEVELS:?}"),
        )
        .to_compile_error()
        .into();
    }
    let level = Ident::new(&level, Span::call_site());

    // Async tests get their own runtime
    let attrs = &input.attrs;
    let vis = &input.vis;
    let name = &input.sig.ident;
    let output = &input.sig.output;
    let block = &input.block;
    let body = if input.sig.asyncness.is_some() {
        quote! {
            {
                // Runtime threads (workers and the blocking pool) log to the same subscriber
                let threads = dispatcher.clone();
                ::tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .on_thread_start(move || {
                        ::std::mem::forget(::tracing::dispatcher::set_default(&threads));
                    })
                    .build()
                    .expect("failed to build runtime")
                    .block_on(async move #block)
            }
        }
    } else {
        quote! { #block }
    };

    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() #output {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);
            ::tracing::dispatcher::with_default(&dispatcher, || #body)
        }
    };
    TokenStream::from(expanded)
}
