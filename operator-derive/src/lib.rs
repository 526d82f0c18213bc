use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, parse_macro_input};

/// Implements `crate::conditions::Conditions` for a status struct.
///
/// The conditions list is the field marked `#[conditions]`, or the field named
/// `conditions` when no field is marked. The field must have the type
/// `Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>>`.
#[proc_macro_derive(Conditions, attributes(conditions))]
pub fn derive_conditions(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let field = match conditions_field(&input) {
        Ok(field) => field,
        Err(e) => return e.to_compile_error().into(),
    };

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics crate::conditions::Conditions for #name #ty_generics #where_clause {
            fn conditions(&self) -> &Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>> {
                &self.#field
            }
            fn conditions_mut(&mut self) -> &mut Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>> {
                &mut self.#field
            }
        }
    };

    TokenStream::from(expanded)
}

fn conditions_field(input: &DeriveInput) -> syn::Result<Ident> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "#[derive(Conditions)] only supports structs",
        ));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "#[derive(Conditions)] requires named fields",
        ));
    };

    let marked: Vec<&Ident> = fields
        .named
        .iter()
        .filter(|f| f.attrs.iter().any(|a| a.path().is_ident("conditions")))
        .filter_map(|f| f.ident.as_ref())
        .collect();
    match marked.as_slice() {
        [one] => return Ok((*one).clone()),
        [] => {}
        [_, second, ..] => {
            return Err(syn::Error::new_spanned(
                second,
                "only one field may be marked #[conditions]",
            ));
        }
    }

    fields
        .named
        .iter()
        .filter_map(|f| f.ident.as_ref())
        .find(|ident| *ident == "conditions")
        .cloned()
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &input.ident,
                "#[derive(Conditions)] requires a `conditions` field or a field marked #[conditions]",
            )
        })
}
