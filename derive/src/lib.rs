use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{
    parse_macro_input, Attribute, Data, DataEnum, DataStruct, DeriveInput, Fields, Ident, Index,
    Member,
};

enum StructPolicy {
    All,
    None,
    Fields,
}

fn struct_policy(attrs: &[Attribute]) -> syn::Result<StructPolicy> {
    let mut policy = StructPolicy::Fields;

    for attr in attrs.iter().filter(|attr| attr.path().is_ident("scan")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("all") {
                policy = StructPolicy::All;
                Ok(())
            } else if meta.path.is_ident("none") {
                policy = StructPolicy::None;
                Ok(())
            } else {
                Err(meta.error("expected `all` or `none`"))
            }
        })?;
    }

    Ok(policy)
}

fn is_pointer_field(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| attr.path().is_ident("scan"))
}

/// Derives `n00b::Scan` for `#[repr(C)]` structs.
///
/// Fields tagged `#[scan]` hold heap pointers; every word they cover is
/// marked in the generated scan map. `#[scan(all)]` or `#[scan(none)]`
/// on the type itself picks a whole-allocation policy instead, and is
/// required for enums.
#[proc_macro_derive(Scan, attributes(scan))]
pub fn scan(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = input.ident.clone();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let policy = match struct_policy(&input.attrs) {
        Ok(policy) => policy,
        Err(err) => return err.to_compile_error().into(),
    };

    let marks = match (&policy, &input.data) {
        (StructPolicy::Fields, Data::Struct(DataStruct { fields, .. })) => {
            let members: Vec<_> = match fields {
                Fields::Named(fields) => fields
                    .named
                    .iter()
                    .filter(|field| is_pointer_field(&field.attrs))
                    .map(|field| {
                        let ident = field.ident.clone().unwrap();
                        (Member::Named(ident), field.ty.clone())
                    })
                    .collect(),
                Fields::Unnamed(fields) => fields
                    .unnamed
                    .iter()
                    .enumerate()
                    .filter(|(_, field)| is_pointer_field(&field.attrs))
                    .map(|(i, field)| (Member::Unnamed(Index::from(i)), field.ty.clone()))
                    .collect(),
                Fields::Unit => vec![],
            };

            members
                .into_iter()
                .map(|(member, ty)| {
                    quote! {
                        map.set_range(
                            ::core::mem::offset_of!(Self, #member) / ::core::mem::size_of::<usize>(),
                            ::core::mem::size_of::<#ty>() / ::core::mem::size_of::<usize>(),
                        );
                    }
                })
                .collect::<Vec<_>>()
        }
        (StructPolicy::Fields, Data::Enum(DataEnum { .. })) => {
            return syn::Error::new(
                Span::call_site(),
                "#[derive(Scan)] on an enum needs #[scan(all)] or #[scan(none)]",
            )
            .to_compile_error()
            .into();
        }
        (_, Data::Union(_)) => {
            return syn::Error::new(Span::call_site(), "#[derive(Scan)] is not implemented for unions")
                .to_compile_error()
                .into();
        }
        _ => vec![],
    };

    let map_fn = Ident::new("__n00b_scan_map", Span::mixed_site());

    let expanded = match policy {
        StructPolicy::All => quote! {
            #[automatically_derived]
            unsafe impl #impl_generics n00b::Scan for #name #ty_generics #where_clause {
                const POLICY: n00b::ScanPolicy = n00b::ScanPolicy::All;
            }
        },
        StructPolicy::Fields if !marks.is_empty() => quote! {
            impl #impl_generics #name #ty_generics #where_clause {
                #[doc(hidden)]
                fn #map_fn(_words: usize, map: &mut n00b::ScanMap) {
                    #(#marks)*
                }
            }

            #[automatically_derived]
            unsafe impl #impl_generics n00b::Scan for #name #ty_generics #where_clause {
                const POLICY: n00b::ScanPolicy = n00b::ScanPolicy::Map(Self::#map_fn);
            }
        },
        _ => quote! {
            #[automatically_derived]
            unsafe impl #impl_generics n00b::Scan for #name #ty_generics #where_clause {
                const POLICY: n00b::ScanPolicy = n00b::ScanPolicy::None;
            }
        },
    };

    TokenStream::from(expanded)
}
