//! Macros for use with cofiber.

extern crate proc_macro;

use proc_macro::TokenStream;

mod entry;

/// Runs the annotated function body inside a task fiber on the calling thread.
///
/// `#[cofiber::main(stack_size = 262144)]` overrides the fiber's stack size.
#[proc_macro_attribute]
pub fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    entry::main_impl(args, item)
}
