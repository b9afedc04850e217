use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitInt, ReturnType};

pub(crate) fn main_impl(args: TokenStream, item: TokenStream) -> TokenStream {
    let mut stack_size: Option<LitInt> = None;
    let args_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("stack_size") {
            stack_size = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported cofiber::main argument"))
        }
    });
    parse_macro_input!(args with args_parser);
    let input = parse_macro_input!(item as ItemFn);

    expand(input, stack_size)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: ItemFn, stack_size: Option<LitInt>) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    if let Some(asyncness) = sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "cofiber::main cannot be used on async functions",
        ));
    }

    let output: TokenStream2 = match &sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };
    let stack_size = match stack_size {
        Some(lit) => quote! { #lit },
        None => quote! { 0 },
    };

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            let _ = ::cofiber::Fiber::current();
            let __slot = ::std::rc::Rc::new(::std::cell::Cell::new(::std::option::Option::None));
            let __out = __slot.clone();
            let __body = move || -> #output #block;
            let __fiber = match ::cofiber::Fiber::with_stack_size(
                move || __out.set(::std::option::Option::Some(__body())),
                #stack_size,
            ) {
                ::std::result::Result::Ok(fiber) => fiber,
                ::std::result::Result::Err(e) => panic!("cofiber::main cannot create its fiber: {}", e),
            };
            while !__fiber.state().is_terminal() {
                __fiber.resume();
            }
            match __slot.take() {
                ::std::option::Option::Some(result) => result,
                ::std::option::Option::None => panic!("cofiber::main body faulted in fiber {}", __fiber.id()),
            }
        }
    })
}
