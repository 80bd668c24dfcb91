//! `#[derive(Equivalence)]` for structs made of types that already have an equivalent datatype.
//!
//! The generated datatype is a struct datatype with one member per field, resized to the size of
//! the Rust type so that slices of it step correctly. It is built and committed once, on first
//! use. Fields may be plain types, arrays or tuples thereof.
//!
//! `#[mpi(crate = "path")]` names the runtime crate if it is not reachable as `::mpi_p2p`.

#![recursion_limit = "256"]

type TokenStream1 = proc_macro::TokenStream;
type TokenStream2 = proc_macro2::TokenStream;

use quote::quote;
use syn::{Fields, Type};

#[proc_macro_derive(Equivalence, attributes(mpi))]
pub fn create_user_datatype(input: TokenStream1) -> TokenStream1 {
    let ast: syn::DeriveInput = syn::parse(input).expect("Couldn't parse struct");
    let krate = match crate_path(&ast.attrs) {
        Ok(krate) => krate,
        Err(err) => return err.to_compile_error().into(),
    };
    if !ast.generics.params.is_empty() {
        return syn::Error::new_spanned(
            &ast.generics,
            "#[derive(Equivalence)] is not compatible with generic types",
        )
        .to_compile_error()
        .into();
    }
    let result = match ast.data {
        syn::Data::Enum(_) => panic!("#[derive(Equivalence)] is not compatible with enums"),
        syn::Data::Union(_) => panic!("#[derive(Equivalence)] is not compatible with unions"),
        syn::Data::Struct(ref s) => equivalence_for_struct(&krate, &ast, &s.fields),
    };
    result.into()
}

fn crate_path(attrs: &[syn::Attribute]) -> syn::Result<syn::Path> {
    let mut krate: syn::Path = syn::parse_quote!(::mpi_p2p);
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("mpi")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let path: syn::LitStr = meta.value()?.parse()?;
                krate = path.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported mpi attribute, expected `crate`"))
            }
        })?;
    }
    Ok(krate)
}

/// An array of the `n` member datatypes, each built by one of `types`.
fn member_types(krate: &syn::Path, types: Vec<TokenStream2>) -> TokenStream2 {
    let n = types.len();
    quote! {
        {
            let types: [#krate::datatype::Datatype; #n] = [#(#types),*];
            types
        }
    }
}

fn equivalence_for_tuple_field(krate: &syn::Path, type_tuple: &syn::TypeTuple) -> TokenStream2 {
    let field_blocklengths = type_tuple.elems.iter().map(|_| quote! {1 as #krate::Count});
    let blocklengths = quote! {[#(#field_blocklengths),*]};

    let field_displacements = type_tuple.elems.iter().enumerate().map(|(i, _)| {
        let field = syn::Index::from(i);
        quote!(#krate::internal::memoffset::offset_of_tuple!(#type_tuple, #field))
    });
    let displacements = quote! {[#(#field_displacements as #krate::Address),*]};

    let field_datatypes = type_tuple
        .elems
        .iter()
        .map(|elem| equivalence_for_type(krate, elem))
        .collect();
    let datatypes = member_types(krate, field_datatypes);

    quote! {
        #krate::datatype::Datatype::structured(&#blocklengths, &#displacements, &#datatypes)?
            .resized(0, ::std::mem::size_of::<#type_tuple>() as #krate::Address)?
    }
}

fn equivalence_for_array_field(krate: &syn::Path, type_array: &syn::TypeArray) -> TokenStream2 {
    let ty = equivalence_for_type(krate, &type_array.elem);
    let len = &type_array.len;
    quote! { #krate::datatype::Datatype::contiguous((#len) as #krate::Count, &#ty)? }
}

fn equivalence_for_type(krate: &syn::Path, ty: &syn::Type) -> TokenStream2 {
    match ty {
        Type::Path(ref type_path) => quote!(
                <#type_path as #krate::datatype::Equivalence>::equivalent_datatype()),
        Type::Tuple(ref type_tuple) => equivalence_for_tuple_field(krate, type_tuple),
        Type::Array(ref type_array) => equivalence_for_array_field(krate, type_array),
        _ => panic!("Unsupported type!"),
    }
}

fn equivalence_for_struct(krate: &syn::Path, ast: &syn::DeriveInput, fields: &Fields) -> TokenStream2 {
    let ident = &ast.ident;

    let field_blocklengths = fields.iter().map(|_| quote! {1 as #krate::Count});
    let blocklengths = quote! {[#(#field_blocklengths),*]};

    let field_displacements: Vec<_> = match fields {
        Fields::Named(ref fields) => fields
            .named
            .iter()
            .filter_map(|field| field.ident.as_ref())
            .map(|name| quote!(#krate::internal::memoffset::offset_of!(#ident, #name)))
            .collect(),
        Fields::Unnamed(ref fields) => fields
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let index = syn::Index::from(i);
                quote!(#krate::internal::memoffset::offset_of!(#ident, #index))
            })
            .collect(),
        Fields::Unit => vec![],
    };
    let n = field_displacements.len();
    let displacements = quote! {{
        let displacements: [#krate::Address; #n] = [#(#field_displacements as #krate::Address),*];
        displacements
    }};
    let blocklengths = quote! {{
        let blocklengths: [#krate::Count; #n] = #blocklengths;
        blocklengths
    }};

    let field_datatypes = fields
        .iter()
        .map(|field| equivalence_for_type(krate, &field.ty))
        .collect();
    let datatypes = member_types(krate, field_datatypes);

    quote! {
        unsafe impl #krate::datatype::Equivalence for #ident {
            fn equivalent_datatype() -> #krate::datatype::Datatype {
                static DATATYPE: #krate::internal::Lazy<#krate::datatype::Datatype> =
                    #krate::internal::Lazy::new(|| {
                        let describe = || -> #krate::Result<#krate::datatype::Datatype> {
                            #krate::datatype::Datatype::structured(
                                &#blocklengths,
                                &#displacements,
                                &#datatypes,
                            )?
                            .resized(0, ::std::mem::size_of::<#ident>() as #krate::Address)
                        };
                        match describe() {
                            Ok(datatype) => datatype.committed(),
                            Err(err) => panic!(
                                "cannot describe {} as a datatype: {}",
                                stringify!(#ident),
                                err
                            ),
                        }
                    });

                DATATYPE.clone()
            }
        }
    }
}
